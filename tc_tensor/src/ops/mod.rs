//! Tensor operations.
//!
//! Each operation has a plain form that only computes, a `*_with_grad` form
//! that also wires the graph, and an [`Operation`](crate::Operation)
//! implementation tying the two together. Plain forms match on the operands'
//! storage once: host buffers go straight to the parallel kernels, device
//! buffers go through the built-in kernel programs.

mod activation;
mod arithmetic;
mod conv;
mod matmul;
mod reduce;
mod shape_ops;

use tc_backend_cpu::KernelConfig;

pub use activation::ActivationOp;
pub use arithmetic::ArithmeticOp;
pub use conv::Conv2dOp;
pub use matmul::MatMulOp;
pub use reduce::{MeanOp, ScaleOp, SumOp};
pub use shape_ops::{ConcatOp, ReshapeOp, SliceOp, TransposeOp};

pub(crate) use conv::{conv_batch, conv_filter_grad_batch};

fn cfg() -> &'static KernelConfig {
    KernelConfig::shared()
}
