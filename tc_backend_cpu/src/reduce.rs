//! Sum along one axis.
//!
//! A contiguous buffer is viewed as `[outer, reduced, inner]`; the reduced
//! axis is summed away, leaving `[outer, inner]`.

use tracing::instrument;

use crate::config::KernelConfig;
use crate::parallel::fork_join_rows;
use crate::simd::{self, BinaryOp};

/// Split `shape` around `axis` into `(outer, reduced, inner)` extents.
pub fn split_extents(shape: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = shape[..axis].iter().product();
    let inner = shape[axis + 1..].iter().product();
    (outer, shape[axis], inner)
}

/// Overwrite `out[outer, inner]` with sums over the middle axis of
/// `src[outer, reduced, inner]`. Parallel over the outer index.
#[instrument(level = "trace", skip(src, out, cfg))]
pub fn sum_axis_into(
    src: &[f32],
    out: &mut [f32],
    outer: usize,
    reduced: usize,
    inner: usize,
    cfg: &KernelConfig,
) {
    assert_eq!(src.len(), outer * reduced * inner, "reduction source has wrong length");
    assert_eq!(out.len(), outer * inner, "reduction target has wrong length");
    if out.is_empty() {
        return;
    }

    let grain = (cfg.reduce_split / (reduced * inner).max(1)).max(1);
    fork_join_rows(out, inner, grain, &|first, block: &mut [f32]| {
        for (local, row) in block.chunks_exact_mut(inner).enumerate() {
            let o = first + local;
            let slab = &src[o * reduced * inner..(o + 1) * reduced * inner];
            if inner == 1 {
                row[0] = simd::sum(slab);
                continue;
            }
            row.fill(0.0);
            for slice in slab.chunks_exact(inner) {
                simd::binary_assign(BinaryOp::Add, row, slice);
            }
        }
    });
}

/// Allocating form of [`sum_axis_into`] taking a shape and an axis.
pub fn sum_axis(src: &[f32], shape: &[usize], axis: usize, cfg: &KernelConfig) -> Vec<f32> {
    let (outer, reduced, inner) = split_extents(shape, axis);
    let mut out = vec![0.0; outer * inner];
    sum_axis_into(src, &mut out, outer, reduced, inner, cfg);
    out
}
