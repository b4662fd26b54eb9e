//! Example: Shortest Paths with the Min-Plus Semiring
//!
//! Swapping the operator pair turns the grid into a relaxation step of
//! all-pairs shortest paths: `D' = D (min,+) D` doubles the number of hops
//! covered. Repeating it log2(n) times gives the full distance matrix.
//!
//! Run with: cargo run --example tropical_paths

use systolic_gemm::{reference_product, Add, GemmConfig, Matrix, Max, Min, SystolicGemm};

// Large enough to never win a min, small enough to never overflow a sum
const NO_EDGE: i64 = i64::MAX / 4;

fn main() {
    println!("=== Tropical Products ===\n");

    // Directed ring of 8 nodes with a few chords
    let n = 8;
    let mut weights = vec![vec![NO_EDGE; n]; n];
    for i in 0..n {
        weights[i][i] = 0;
        weights[i][(i + 1) % n] = 3;
    }
    weights[0][4] = 5;
    weights[2][7] = 4;
    weights[5][1] = 2;
    let mut distances = Matrix::from_rows(&weights).unwrap();

    // 8x8 on a 2x2 grid of PEs, 2x2 inner tiles of 2-wide packs
    let config = GemmConfig::from_tiling(8, (1, 1), (2, 2), (2, 2), (2, 2)).with_memory_width(2);
    let min_plus = SystolicGemm::<i64, Add, Min>::new(config.clone()).unwrap();

    println!("Example 1: all-pairs shortest paths by repeated squaring\n");
    let mut hops = 1;
    while hops < n {
        distances = min_plus.multiply_matrices(&distances, &distances).unwrap();
        hops *= 2;
        println!("After covering {} hops:", hops);
        print_distances(&distances);
    }

    // Example 2: max-plus picks the heaviest two-hop route
    println!("Example 2: max-plus on the same grid\n");
    let gains = Matrix::new(8, 8, (0..64).map(|v| (v * 7) % 11).collect()).unwrap();
    let max_plus = SystolicGemm::<i64, Add, Max>::new(config).unwrap();
    let best = max_plus.multiply_matrices(&gains, &gains).unwrap();
    let expected = reference_product::<i64, Add, Max>(&gains, &gains).unwrap();
    println!("Best two-step gain from node 0: {:?}", best.row(0));
    println!("Matches reference: {}", best == expected);
}

fn print_distances(distances: &Matrix<i64>) {
    for row in 0..distances.rows() {
        let cells: Vec<String> = distances
            .row(row)
            .iter()
            .map(|&d| if d >= NO_EDGE { "  -".to_string() } else { format!("{:>3}", d) })
            .collect();
        println!("  {}", cells.join(" "));
    }
    println!();
}
