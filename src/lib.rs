//! Systolic GEMM
//!
//! A tiled, fully pipelined streaming dataflow engine for dense matrix
//! products. An `R x S` grid of processing elements each own a block of
//! the output; operands are passed hand to hand across the grid through
//! bounded channels, and finished tiles are relayed up to a fan-in that
//! writes the result back in row-major order.
//!
//! # Example
//!
//! ```rust
//! use systolic_gemm::{GemmConfig, SystolicGemm};
//!
//! // One processing element, no sub-tiling: 4x2 @ 2x4
//! let config = GemmConfig::single_pe(4, 2, 4);
//! let gemm = SystolicGemm::<i64>::new(config).unwrap();
//!
//! let a = [1, 2, 3, 4, 5, 6, 7, 8];
//! let b = [1, 0, 0, 0, 0, 1, 0, 0];
//! let c = gemm.multiply(&a, &b).unwrap();
//! assert_eq!(&c[..4], &[1, 2, 0, 0]);
//! ```

pub mod adapters;
pub mod config;
pub mod error;
pub mod feed;
pub mod grid;
pub mod matrix;
pub mod ops;
pub mod pack;
pub mod pe;
pub mod stream;
pub mod topology;

pub use config::{ChannelConfig, GemmConfig, TilingPlan};
pub use error::{GemmError, GemmResult};
pub use grid::{GridReport, SystolicGemm};
pub use matrix::{reference_product, Matrix};
pub use ops::{Add, Element, Extremes, MapOperator, Max, Min, Multiply, ReduceOperator};
pub use pack::Pack;
pub use pe::PeReport;
pub use topology::{StageId, Topology};

/// Multiply two matrices with the ordinary `(*, +)` operators on a grid
/// built from `config`.
pub fn matmul<T>(config: GemmConfig, a: &Matrix<T>, b: &Matrix<T>) -> GemmResult<Matrix<T>>
where
    T: Element + std::ops::Mul<Output = T> + num_traits::Zero,
{
    SystolicGemm::<T, Multiply, Add>::new(config)?.multiply_matrices(a, b)
}
