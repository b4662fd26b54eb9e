//! Example: End-to-End Product on a Single PE
//!
//! Runs the smallest possible grid, one processing element without any
//! sub-tiling, and then the same product on a 2x2 grid.
//!
//! Run with: cargo run --example end_to_end

use systolic_gemm::{reference_product, Add, GemmConfig, Matrix, Multiply, SystolicGemm};

fn main() {
    println!("=== End-to-End Systolic GEMM ===\n");

    // Example 1: one PE, a single pack spans all of N and all of M
    println!("Example 1: 4x2 @ 2x4 on one processing element\n");

    let a = Matrix::from_rows(&[vec![1, 2], vec![3, 4], vec![5, 6], vec![7, 8]]).unwrap();
    let b = Matrix::from_rows(&[vec![1, 0, 0, 0], vec![0, 1, 0, 0]]).unwrap();

    let gemm = SystolicGemm::<i64>::new(GemmConfig::single_pe(4, 2, 4)).unwrap();
    let c = gemm.multiply_matrices(&a, &b).unwrap();

    // B picks out the two columns of A and pads with zeros:
    // | 1 2 0 0 |
    // | 3 4 0 0 |
    // | 5 6 0 0 |
    // | 7 8 0 0 |
    for row in 0..c.rows() {
        println!("  {:?}", c.row(row));
    }
    println!();

    // Example 2: the same problem tiled over a 2x2 grid
    println!("Example 2: same product on a 2x2 grid with 2-wide packs\n");

    let config = GemmConfig::from_tiling(2, (1, 1), (2, 2), (1, 1), (2, 2)).with_memory_width(2);
    let gemm = SystolicGemm::<i64, Multiply, Add>::new(config).unwrap();
    let mut out = vec![0; 16];
    let report = gemm.multiply_into(a.data(), b.data(), &mut out).unwrap();

    let expected = reference_product::<i64, Multiply, Add>(&a, &b).unwrap();
    println!("Matches reference: {}", out == expected.data());
    println!();
    println!("{}", report);

    println!("JSON report:");
    println!("{}", report.to_json().unwrap());
}
