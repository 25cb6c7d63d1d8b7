//! Parallel elementwise kernels over contiguous buffers.

use crate::config::KernelConfig;
use crate::parallel::{bounded_grain, fork_join_rows};
use crate::simd::{self, BinaryOp};

/// `dst[i] = f(src[i])`.
pub fn map_into<F>(src: &[f32], dst: &mut [f32], f: F, cfg: &KernelConfig)
where
    F: Fn(f32) -> f32 + Sync,
{
    assert_eq!(src.len(), dst.len());
    let grain = bounded_grain(src.len(), cfg.elementwise_split);
    fork_join_rows(dst, 1, grain, &|first, block: &mut [f32]| {
        for (out, &x) in block.iter_mut().zip(&src[first..]) {
            *out = f(x);
        }
    });
}

/// Allocating form of [`map_into`].
pub fn map<F>(src: &[f32], f: F, cfg: &KernelConfig) -> Vec<f32>
where
    F: Fn(f32) -> f32 + Sync,
{
    let mut dst = vec![0.0; src.len()];
    map_into(src, &mut dst, f, cfg);
    dst
}

/// `acc[i] = op(acc[i], b[i])` for equally long buffers.
pub fn binary_assign(op: BinaryOp, acc: &mut [f32], b: &[f32], cfg: &KernelConfig) {
    assert_eq!(acc.len(), b.len());
    let grain = bounded_grain(acc.len(), cfg.elementwise_split);
    fork_join_rows(acc, 1, grain, &|first, block: &mut [f32]| {
        let len = block.len();
        simd::binary_assign(op, block, &b[first..first + len]);
    });
}

/// `acc[r, j] = op(acc[r, j], row[j])`: one operand row applied to every row
/// of a `[rows, row.len()]` buffer.
pub fn binary_assign_rows(op: BinaryOp, acc: &mut [f32], row: &[f32], cfg: &KernelConfig) {
    if row.is_empty() {
        return;
    }
    assert_eq!(acc.len() % row.len(), 0, "buffer is not a whole number of rows");
    let grain = (cfg.elementwise_split / row.len()).max(1);
    fork_join_rows(acc, row.len(), grain, &|_, block: &mut [f32]| {
        for chunk in block.chunks_exact_mut(row.len()) {
            simd::binary_assign(op, chunk, row);
        }
    });
}
