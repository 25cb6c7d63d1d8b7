//! Swap the last two dimensions of a batch of row-major planes.

use tracing::instrument;

use crate::config::KernelConfig;
use crate::parallel::{bounded_grain, fork_join_rows};

/// Side of the square tiles the copy walks in.
const TILE: usize = 32;

/// Write the transpose of every `[rows, cols]` plane of `src` into `dst` as a
/// `[cols, rows]` plane.
///
/// The `batch * cols` output rows are bisected; each leaf copies its rows in
/// `TILE x TILE` blocks so reads from `src` stay within a few cache lines.
#[instrument(level = "trace", skip(src, dst, cfg))]
pub fn transpose_into(
    src: &[f32],
    dst: &mut [f32],
    batch: usize,
    rows: usize,
    cols: usize,
    cfg: &KernelConfig,
) {
    let total = batch * rows * cols;
    assert_eq!(src.len(), total, "transpose source is not {batch}x{rows}x{cols}");
    assert_eq!(dst.len(), total, "transpose target is not {batch}x{cols}x{rows}");
    if total == 0 {
        return;
    }

    let grain_rows = bounded_grain(total, cfg.transpose_split).div_ceil(rows);
    fork_join_rows(dst, rows, grain_rows, &|first, block: &mut [f32]| {
        copy_tiles(src, block, first, rows, cols)
    });
}

/// Allocating form of [`transpose_into`].
pub fn transpose(src: &[f32], batch: usize, rows: usize, cols: usize, cfg: &KernelConfig) -> Vec<f32> {
    let mut dst = vec![0.0; src.len()];
    transpose_into(src, &mut dst, batch, rows, cols, cfg);
    dst
}

// `block` holds output rows `first..`, each one source column of length `rows`.
fn copy_tiles(src: &[f32], block: &mut [f32], first: usize, rows: usize, cols: usize) {
    let plane = rows * cols;
    let out_rows = block.len() / rows;
    for o0 in (0..out_rows).step_by(TILE) {
        let o1 = (o0 + TILE).min(out_rows);
        for r0 in (0..rows).step_by(TILE) {
            let r1 = (r0 + TILE).min(rows);
            for o in o0..o1 {
                let (b, c) = ((first + o) / cols, (first + o) % cols);
                let base = b * plane + c;
                let out = &mut block[o * rows..(o + 1) * rows];
                for r in r0..r1 {
                    out[r] = src[base + r * cols];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_square() {
        let out = transpose(&[1.0, 2.0, 3.0, 4.0], 1, 2, 2, &KernelConfig::default());
        assert_eq!(out, vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_batched_rectangular() {
        let src: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let out = transpose(&src, 2, 2, 3, &KernelConfig::eager());
        assert_eq!(
            out,
            vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0, 6.0, 9.0, 7.0, 10.0, 8.0, 11.0]
        );
    }

    #[test]
    fn test_spans_several_tiles() {
        let (batch, rows, cols) = (2, TILE + 9, 2 * TILE + 3);
        let src: Vec<f32> = (0..batch * rows * cols).map(|i| i as f32).collect();
        for cfg in [KernelConfig::sequential(), KernelConfig::eager()] {
            let out = transpose(&src, batch, rows, cols, &cfg);
            for b in 0..batch {
                for r in 0..rows {
                    for c in 0..cols {
                        let plane = rows * cols;
                        assert_eq!(out[b * plane + c * rows + r], src[b * plane + r * cols + c]);
                    }
                }
            }
        }
    }

    #[test]
    fn test_involution() {
        let src: Vec<f32> = (0..60).map(|i| i as f32 * 0.5).collect();
        let cfg = KernelConfig::eager();
        let once = transpose(&src, 3, 4, 5, &cfg);
        let twice = transpose(&once, 3, 5, 4, &cfg);
        assert_eq!(twice, src);
    }
}
