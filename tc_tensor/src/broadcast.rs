//! Broadcasting elementwise arithmetic.
//!
//! [`fast_path`] recognizes the layouts that map straight onto contiguous
//! kernels: identical shapes, and a rank-1 operand matching the last
//! dimension of a rank-2 or rank-3 target. Everything else goes through
//! [`fallback`], which walks every output element and reads each operand
//! through a zero-stride broadcast view. Both paths round identically, so on
//! the shapes the fast path claims their results are bit-identical.

use tc_backend_cpu::parallel::{bounded_grain, fork_join_rows};
use tc_backend_cpu::{elementwise, BinaryOp, KernelConfig};

use crate::error::{Result, TensorError};
use crate::shape::{unravel, Shape};
use crate::view::TensorView;

/// Layouts served without index arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPath {
    /// Shapes are equal.
    Same,
    /// Operand is one row applied to every row of the target.
    Rows,
}

/// Fast path for `target op= operand`, if one applies.
pub fn fast_path(target: &Shape, operand: &Shape) -> Option<FastPath> {
    if target == operand {
        return Some(FastPath::Same);
    }
    let rows = matches!(target.rank(), 2 | 3) && operand.rank() == 1 && operand.dim(0) == target.last();
    rows.then_some(FastPath::Rows)
}

/// Right-aligned broadcast shape, or `ShapeMismatch`.
pub fn broadcast_shape(op: &'static str, a: &Shape, b: &Shape) -> Result<Shape> {
    a.broadcast_with(b).ok_or_else(|| TensorError::ShapeMismatch {
        op,
        lhs: a.clone(),
        rhs: b.clone(),
    })
}

/// General path: `op(a, b)` over the broadcast shape of the two operands.
pub fn fallback(op: BinaryOp, a: &[f32], a_shape: &Shape, b: &[f32], b_shape: &Shape, cfg: &KernelConfig) -> Result<(Vec<f32>, Shape)> {
    let out_shape = broadcast_shape(op_name(op), a_shape, b_shape)?;
    let a_view = TensorView::new(a, a_shape.clone())?.broadcast_to(&out_shape)?;
    let b_view = TensorView::new(b, b_shape.clone())?.broadcast_to(&out_shape)?;
    let dims = out_shape.dims();

    let mut out = vec![0.0; out_shape.elements()];
    let grain = bounded_grain(out.len(), cfg.elementwise_split);
    fork_join_rows(&mut out, 1, grain, &|first, block: &mut [f32]| {
        let mut index = vec![0; dims.len()];
        for (local, slot) in block.iter_mut().enumerate() {
            unravel(first + local, dims, &mut index);
            *slot = op.apply(a_view.at(&index), b_view.at(&index));
        }
    });
    Ok((out, out_shape))
}

/// Apply a fast path in place. Returns false, leaving `acc` untouched, when
/// none applies.
pub fn fast_path_assign(op: BinaryOp, acc: &mut [f32], acc_shape: &Shape, b: &[f32], b_shape: &Shape, cfg: &KernelConfig) -> bool {
    match fast_path(acc_shape, b_shape) {
        Some(FastPath::Same) => elementwise::binary_assign(op, acc, b, cfg),
        Some(FastPath::Rows) => elementwise::binary_assign_rows(op, acc, b, cfg),
        None => return false,
    }
    true
}

/// `acc = op(acc, b)` where `b` broadcasts to `acc`'s shape.
pub fn broadcast_assign(op: BinaryOp, acc: &mut [f32], acc_shape: &Shape, b: &[f32], b_shape: &Shape, cfg: &KernelConfig) -> Result<()> {
    let out_shape = broadcast_shape(op_name(op), acc_shape, b_shape)?;
    if &out_shape != acc_shape {
        return Err(TensorError::ShapeMismatch {
            op: op_name(op),
            lhs: acc_shape.clone(),
            rhs: b_shape.clone(),
        });
    }
    if fast_path_assign(op, acc, acc_shape, b, b_shape, cfg) {
        return Ok(());
    }
    let (out, _) = fallback(op, acc, acc_shape, b, b_shape, cfg)?;
    acc.copy_from_slice(&out);
    Ok(())
}

/// `op(a, b)` into a new buffer, either side broadcasting.
pub fn broadcast_binary(op: BinaryOp, a: &[f32], a_shape: &Shape, b: &[f32], b_shape: &Shape, cfg: &KernelConfig) -> Result<(Vec<f32>, Shape)> {
    let out_shape = broadcast_shape(op_name(op), a_shape, b_shape)?;
    if &out_shape == a_shape && fast_path(a_shape, b_shape).is_some() {
        let mut out = a.to_vec();
        fast_path_assign(op, &mut out, a_shape, b, b_shape, cfg);
        return Ok((out, out_shape));
    }
    fallback(op, a, a_shape, b, b_shape, cfg)
}

pub(crate) fn op_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "add",
        BinaryOp::Sub => "sub",
        BinaryOp::Mul => "mul",
        BinaryOp::Div => "div",
    }
}
