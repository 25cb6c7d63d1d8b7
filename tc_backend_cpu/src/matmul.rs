//! Batched matrix multiply, `C += op(A) · op(B)`.
//!
//! Work is partitioned over the `batch * m` output rows. Small problems run on
//! the calling thread; larger ones are bisected with [`fork_join_rows`] until a
//! leaf holds at most `matmul_split_rows` rows. One of four row kernels is
//! chosen per call for the (trans_a, trans_b) combination. Inside a leaf the
//! kernels walk B in cache-sized tiles shared by all of the leaf's rows.

use tracing::instrument;

use crate::config::KernelConfig;
use crate::parallel::fork_join_rows;
use crate::simd;

/// Logical problem size: `A[batch, m, n] · B[batch?, n, p] -> C[batch, m, p]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatmulDims {
    pub batch: usize,
    pub m: usize,
    pub n: usize,
    pub p: usize,
    /// When false, B holds a single `n x p` matrix shared by every batch slice.
    pub b_batched: bool,
}

impl MatmulDims {
    pub fn new(batch: usize, m: usize, n: usize, p: usize) -> Self {
        Self { batch, m, n, p, b_batched: true }
    }

    /// Same dims with B shared across the batch.
    pub fn shared_rhs(mut self) -> Self {
        self.b_batched = false;
        self
    }

    pub fn rows(&self) -> usize {
        self.batch * self.m
    }

    /// Multiply-add count, used to decide whether to split.
    pub fn complexity(&self) -> usize {
        self.rows() * self.n * self.p
    }

    pub fn a_len(&self) -> usize {
        self.batch * self.m * self.n
    }

    pub fn b_len(&self) -> usize {
        if self.b_batched {
            self.batch * self.n * self.p
        } else {
            self.n * self.p
        }
    }

    pub fn c_len(&self) -> usize {
        self.batch * self.m * self.p
    }
}

/// Accumulate `op(A) · op(B)` into `c`, which the caller has zeroed.
///
/// With `trans_a` the slices of `a` are stored `[n, m]`; with `trans_b` the
/// slices of `b` are stored `[p, n]`. No data is moved to undo either.
#[instrument(level = "trace", skip_all, fields(batch = dims.batch, m = dims.m, n = dims.n, p = dims.p, trans_a = trans_a, trans_b = trans_b))]
pub fn matmul_into(
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    dims: MatmulDims,
    trans_a: bool,
    trans_b: bool,
    cfg: &KernelConfig,
) {
    assert_eq!(a.len(), dims.a_len(), "lhs buffer does not match {dims:?}");
    assert_eq!(b.len(), dims.b_len(), "rhs buffer does not match {dims:?}");
    assert_eq!(c.len(), dims.c_len(), "output buffer does not match {dims:?}");
    if dims.c_len() == 0 {
        return;
    }

    let rows_kernel: fn(&[f32], &[f32], &MatmulDims, usize, &mut [f32]) = match (trans_a, trans_b) {
        (false, false) => rows_nn,
        (true, false) => rows_tn,
        (false, true) => rows_nt,
        (true, true) => rows_tt,
    };

    if dims.complexity() < cfg.matmul_sequential_threshold {
        rows_kernel(a, b, &dims, 0, c);
        return;
    }

    fork_join_rows(c, dims.p, cfg.matmul_split_rows, &|first_row, block: &mut [f32]| {
        rows_kernel(a, b, &dims, first_row, block)
    });
}

/// Allocating convenience wrapper around [`matmul_into`].
pub fn matmul(
    a: &[f32],
    b: &[f32],
    dims: MatmulDims,
    trans_a: bool,
    trans_b: bool,
    cfg: &KernelConfig,
) -> Vec<f32> {
    let mut c = vec![0.0; dims.c_len()];
    matmul_into(a, b, &mut c, dims, trans_a, trans_b, cfg);
    c
}

#[inline]
fn planes<'a>(a: &'a [f32], b: &'a [f32], dims: &MatmulDims, batch: usize) -> (&'a [f32], &'a [f32]) {
    let a_plane = dims.m * dims.n;
    let b_plane = dims.n * dims.p;
    let b_off = if dims.b_batched { batch * b_plane } else { 0 };
    (
        &a[batch * a_plane..(batch + 1) * a_plane],
        &b[b_off..b_off + b_plane],
    )
}

/// Output columns per tile.
const TILE_J: usize = 256;
/// Depth per tile. A `TILE_K x TILE_J` panel of B stays in cache while every
/// row of the leaf consumes it.
const TILE_K: usize = 64;

#[inline]
fn tiles(len: usize, tile: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..len).step_by(tile).map(move |start| (start, (start + tile).min(len)))
}

/// Shared tiling for the two layouts that stream B rows: `a_at(i, k)` reads
/// A in whichever layout it is stored. Each output element still receives
/// its terms in increasing `k`, so tiling does not change rounding.
#[inline]
fn rows_axpy<F>(a: &[f32], b: &[f32], dims: &MatmulDims, first_row: usize, block: &mut [f32], a_at: F)
where
    F: Fn(&[f32], usize, usize) -> f32,
{
    let (n, p) = (dims.n, dims.p);
    for (j0, j1) in tiles(p, TILE_J) {
        for (k0, k1) in tiles(n, TILE_K) {
            for (local, c_row) in block.chunks_exact_mut(p).enumerate() {
                let row = first_row + local;
                let (bi, i) = (row / dims.m, row % dims.m);
                let (a_plane, b_plane) = planes(a, b, dims, bi);
                let c_tile = &mut c_row[j0..j1];
                for k in k0..k1 {
                    simd::axpy(c_tile, a_at(a_plane, i, k), &b_plane[k * p + j0..k * p + j1]);
                }
            }
        }
    }
}

// A rows are contiguous: each k broadcasts one A element across a B row.
fn rows_nn(a: &[f32], b: &[f32], dims: &MatmulDims, first_row: usize, block: &mut [f32]) {
    let n = dims.n;
    rows_axpy(a, b, dims, first_row, block, |a_plane, i, k| a_plane[i * n + k]);
}

// A stored [n, m].
fn rows_tn(a: &[f32], b: &[f32], dims: &MatmulDims, first_row: usize, block: &mut [f32]) {
    let m = dims.m;
    rows_axpy(a, b, dims, first_row, block, |a_plane, i, k| a_plane[k * m + i]);
}

// B stored [p, n]: every output element is one contiguous dot product. A
// tile of B rows is reused by every row of the leaf.
fn rows_nt(a: &[f32], b: &[f32], dims: &MatmulDims, first_row: usize, block: &mut [f32]) {
    let (n, p) = (dims.n, dims.p);
    let tile = (TILE_J * TILE_K / n.max(1)).clamp(1, TILE_J);
    for (j0, j1) in tiles(p, tile) {
        for (local, c_row) in block.chunks_exact_mut(p).enumerate() {
            let row = first_row + local;
            let (bi, i) = (row / dims.m, row % dims.m);
            let (a_plane, b_plane) = planes(a, b, dims, bi);
            let a_row = &a_plane[i * n..(i + 1) * n];
            for j in j0..j1 {
                c_row[j] += simd::dot(a_row, &b_plane[j * n..(j + 1) * n]);
            }
        }
    }
}

// Neither operand is contiguous along k. Tiled over j only: the scalar
// accumulator must see all of k before it lands in C.
fn rows_tt(a: &[f32], b: &[f32], dims: &MatmulDims, first_row: usize, block: &mut [f32]) {
    let (m, n, p) = (dims.m, dims.n, dims.p);
    let tile = (TILE_J * TILE_K / n.max(1)).clamp(1, TILE_J);
    for (j0, j1) in tiles(p, tile) {
        for (local, c_row) in block.chunks_exact_mut(p).enumerate() {
            let row = first_row + local;
            let (bi, i) = (row / m, row % m);
            let (a_plane, b_plane) = planes(a, b, dims, bi);
            for j in j0..j1 {
                let mut acc = 0.0f32;
                for k in 0..n {
                    acc += a_plane[k * m + i] * b_plane[j * n + k];
                }
                c_row[j] += acc;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(a: &[f32], b: &[f32], m: usize, n: usize, p: usize) -> Vec<f32> {
        let mut c = vec![0.0; m * p];
        for i in 0..m {
            for j in 0..p {
                for k in 0..n {
                    c[i * p + j] += a[i * n + k] * b[k * p + j];
                }
            }
        }
        c
    }

    fn transpose(x: &[f32], rows: usize, cols: usize) -> Vec<f32> {
        let mut out = vec![0.0; x.len()];
        for r in 0..rows {
            for c in 0..cols {
                out[c * rows + r] = x[r * cols + c];
            }
        }
        out
    }

    #[test]
    fn test_ones() {
        let a = vec![1.0; 6];
        let b = vec![1.0; 6];
        let c = matmul(&a, &b, MatmulDims::new(1, 2, 3, 2), false, false, &KernelConfig::default());
        assert_eq!(c, vec![3.0; 4]);
    }

    #[test]
    fn test_all_variants_agree() {
        let (m, n, p) = (5, 7, 3);
        let a: Vec<f32> = (0..m * n).map(|i| (i % 5) as f32 - 2.0).collect();
        let b: Vec<f32> = (0..n * p).map(|i| (i % 3) as f32 + 0.5).collect();
        let expected = naive(&a, &b, m, n, p);
        let at = transpose(&a, m, n);
        let bt = transpose(&b, n, p);
        let dims = MatmulDims::new(1, m, n, p);

        for cfg in [KernelConfig::sequential(), KernelConfig::eager()] {
            assert_eq!(matmul(&a, &b, dims, false, false, &cfg), expected);
            assert_eq!(matmul(&at, &b, dims, true, false, &cfg), expected);
            assert_eq!(matmul(&a, &bt, dims, false, true, &cfg), expected);
            assert_eq!(matmul(&at, &bt, dims, true, true, &cfg), expected);
        }
    }

    #[test]
    fn test_spans_several_tiles() {
        let (m, n, p) = (3, TILE_K * 2 + 5, TILE_J + 17);
        let a: Vec<f32> = (0..m * n).map(|i| (i % 7) as f32 - 3.0).collect();
        let b: Vec<f32> = (0..n * p).map(|i| (i % 4) as f32 - 1.5).collect();
        let expected = naive(&a, &b, m, n, p);
        let at = transpose(&a, m, n);
        let bt = transpose(&b, n, p);
        let dims = MatmulDims::new(1, m, n, p);
        let cfg = KernelConfig::eager();

        assert_eq!(matmul(&a, &b, dims, false, false, &cfg), expected);
        assert_eq!(matmul(&at, &b, dims, true, false, &cfg), expected);
        assert_eq!(matmul(&a, &bt, dims, false, true, &cfg), expected);
        assert_eq!(matmul(&at, &bt, dims, true, true, &cfg), expected);
    }

    #[test]
    fn test_accumulates() {
        let mut c = vec![1.0; 4];
        matmul_into(
            &[1.0, 0.0, 0.0, 1.0],
            &[2.0, 3.0, 4.0, 5.0],
            &mut c,
            MatmulDims::new(1, 2, 2, 2),
            false,
            false,
            &KernelConfig::default(),
        );
        assert_eq!(c, vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_shared_rhs() {
        let a: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let b = vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let dims = MatmulDims::new(2, 2, 3, 2).shared_rhs();
        let c = matmul(&a, &b, dims, false, false, &KernelConfig::eager());
        let mut expected = naive(&a[..6], &b, 2, 3, 2);
        expected.extend(naive(&a[6..], &b, 2, 3, 2));
        assert_eq!(c, expected);
    }

    #[test]
    fn test_empty() {
        let c = matmul(&[], &[], MatmulDims::new(1, 0, 3, 2), false, false, &KernelConfig::default());
        assert!(c.is_empty());
    }
}
