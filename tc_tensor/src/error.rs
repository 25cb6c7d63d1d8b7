//! Tensor error types

use thiserror::Error;

use tc_backend_device::DeviceError;

use crate::shape::Shape;

/// Violations of the autograd graph protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("{op} takes {expected} inputs, got {found}")]
    ArityMismatch {
        op: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{op} backward produced {found} gradients for {expected} inputs")]
    GradientCount {
        op: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("cannot add a consumer to a tensor that backward has already reached; call zero_grad first")]
    EdgeAfterBackward,

    #[error("gradient contribution arrived after the node's backward already ran")]
    ContributionAfterFire,
}

/// Tensor errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TensorError {
    #[error("{op}: incompatible shapes {lhs} and {rhs}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    #[error("{op}: dimension {dim} out of bounds for rank {rank}")]
    DimensionOutOfBounds {
        op: &'static str,
        dim: usize,
        rank: usize,
    },

    #[error("{op}: range {start}..{end} invalid for dimension {dim} of size {size}")]
    InvalidRange {
        op: &'static str,
        dim: usize,
        start: usize,
        end: usize,
        size: usize,
    },

    #[error("{expected} elements expected for shape {shape}, got {found}")]
    ElementCount {
        shape: Shape,
        expected: usize,
        found: usize,
    },

    #[error("{op}: operands live in different places ({lhs} vs {rhs})")]
    PlacementMismatch {
        op: &'static str,
        lhs: String,
        rhs: String,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Result type for tensor operations
pub type Result<T> = std::result::Result<T, TensorError>;
