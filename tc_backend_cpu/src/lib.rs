//! # tc_backend_cpu - Parallel Dense Kernels
//!
//! Pure functions over flat `f32` buffers, shared by host tensors and by the
//! accelerator's built-in kernel programs.
//!
//! ## Overview
//!
//! - [`matmul`] - batched `C += op(A) · op(B)` with four layout variants
//! - [`transpose`] - swap the last two dims of every batch plane
//! - [`conv`] - valid 2-D correlation via im2col, plus its gradients
//! - [`reduce`] - sum along one axis
//! - [`elementwise`] - unary maps and binary ops on contiguous buffers
//!
//! Work is split with [`parallel::fork_join`] on the rayon pool. Where the
//! recursion stops is governed by [`KernelConfig`]; thresholds never change
//! results beyond float reassociation.
//!
//! ## Example
//!
//! ```
//! use tc_backend_cpu::{matmul, KernelConfig, MatmulDims};
//!
//! let c = matmul(&[1.0; 6], &[1.0; 6], MatmulDims::new(1, 2, 3, 2), false, false, KernelConfig::shared());
//! assert_eq!(c, vec![3.0; 4]);
//! ```

pub mod config;
pub mod conv;
pub mod elementwise;
pub mod matmul;
pub mod parallel;
pub mod reduce;
pub mod simd;
pub mod transpose;

pub use config::KernelConfig;
pub use conv::{conv2d, conv2d_filter_grad, conv2d_input_grad, conv2d_into, im2col, ConvDims};
pub use matmul::{matmul, matmul_into, MatmulDims};
pub use reduce::{split_extents, sum_axis, sum_axis_into};
pub use simd::BinaryOp;
pub use transpose::{transpose, transpose_into};
