//! # tc_tensor - Tensors with Reverse-Mode Autograd
//!
//! Dense `f32` tensors whose storage lives either in host memory or on a
//! simulated accelerator, with a reverse-mode gradient graph built as
//! operations are applied.
//!
//! ## Overview
//!
//! - [`Tensor`] - shape, strides, [`Storage`] and an optional graph node
//! - [`Operation`] - forward compute plus backward rule; [`apply`] records it
//! - [`AutogradContext`] - one graph node with explicit fan-in accounting
//! - [`ops`] - arithmetic, matmul, reductions, shape ops, activations, conv
//! - [`broadcast`] - right-aligned broadcasting with row/same-shape fast paths
//! - [`device_kernels`] - the kernel programs device tensors run on
//!
//! Host and device operands cannot be mixed in one operation; move tensors
//! with [`Tensor::to`] and [`Tensor::to_host`] first.
//!
//! ## Example
//!
//! ```
//! use tc_tensor::Tensor;
//!
//! let a = Tensor::ones([2, 3]).track_grad();
//! let b = Tensor::ones([3, 2]).track_grad();
//! let c = a.matmul_with_grad(&b).unwrap();
//! assert_eq!(c.to_vec().unwrap(), vec![3.0; 4]);
//!
//! c.backward().unwrap();
//! assert_eq!(a.grad().unwrap().to_vec().unwrap(), vec![2.0; 6]);
//! ```

pub mod activation;
pub mod autograd;
pub mod broadcast;
pub mod device_kernels;
pub mod error;
pub mod ops;
pub mod region;
pub mod shape;
pub mod storage;
pub mod tensor;
pub mod view;

pub use activation::Activation;
pub use autograd::{apply, AutogradContext, Operation};
pub use device_kernels::{install, BUILTIN_KERNELS};
pub use error::{GraphError, Result, TensorError};
pub use ops::{
    ActivationOp, ArithmeticOp, ConcatOp, Conv2dOp, MatMulOp, MeanOp, ReshapeOp, ScaleOp, SliceOp, SumOp, TransposeOp,
};
pub use shape::{Shape, Strides};
pub use storage::{DeviceStorage, Storage};
pub use tensor::Tensor;
pub use view::TensorView;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::activation::Activation;
    pub use crate::autograd::Operation;
    pub use crate::error::{Result, TensorError};
    pub use crate::shape::Shape;
    pub use crate::tensor::Tensor;
}
