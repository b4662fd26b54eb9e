//! Example: Large Tiled Product
//!
//! Demonstrates how a problem larger than the grid is covered by outer
//! tiles, and how the inner tiles and pack widths divide the block each PE
//! owns.
//!
//! Run with: cargo run --example large_grid

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use systolic_gemm::{reference_product, Add, GemmConfig, Matrix, Multiply, SystolicGemm};

fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Matrix<f64> {
    let data = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
    Matrix::new(rows, cols, data).unwrap()
}

fn main() {
    println!("=== Large Tiled Product ===\n");

    // 64x32 @ 32x48 on a 4x3 grid:
    //   N = 2 outer * 4 rows * 2 inner * 4 pack = 64
    //   M = 2 outer * 3 cols * 2 inner * 4 pack = 48
    let config = GemmConfig::from_tiling(32, (2, 2), (4, 3), (2, 2), (4, 4)).with_memory_width(4);
    let gemm = SystolicGemm::<f64, Multiply, Add>::new(config).unwrap();
    let plan = *gemm.plan();

    println!("Tiling analysis:");
    println!("  - Problem: {}x{} @ {}x{}", plan.size_n, plan.size_k, plan.size_k, plan.size_m);
    println!(
        "  - Outer tiles: {} ({}x{})",
        plan.outer_tiles(),
        plan.outer_tiles_n,
        plan.outer_tiles_m
    );
    println!("  - Outer tile: {}x{} elements", plan.outer_tile_size_n, plan.outer_tile_size_m);
    println!("  - Block per PE: {}x{} elements", plan.block_rows(), plan.block_cols());
    println!("  - Steps per PE: {}", plan.steps());
    println!();

    let topology = gemm.topology().unwrap();
    println!(
        "Dataflow graph: {} stages, {} channels\n",
        topology.stages.len(),
        topology.channels.len()
    );

    let mut rng = StdRng::seed_from_u64(2024);
    let a = random_matrix(&mut rng, plan.size_n, plan.size_k);
    let b = random_matrix(&mut rng, plan.size_k, plan.size_m);

    let mut c = vec![0.0; plan.size_n * plan.size_m];
    let report = gemm.multiply_into(a.data(), b.data(), &mut c).unwrap();
    let expected = reference_product::<f64, Multiply, Add>(&a, &b).unwrap();

    let max_error = c
        .iter()
        .zip(expected.data())
        .map(|(got, want)| (got - want).abs())
        .fold(0.0, f64::max);

    println!("Elapsed: {:.3} ms", report.elapsed_ms);
    println!("Packs reduced: {}", report.packs_reduced());
    println!("Packs forwarded: {}", report.packs_forwarded());
    println!("Max abs error vs reference: {:e}", max_error);
}
