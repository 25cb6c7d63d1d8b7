//! Generic fork-join divide-and-conquer on the rayon pool.
//!
//! A range is bisected until a piece is no longer than its grain, both halves
//! run through `rayon::join`, and the caller blocks until both have finished.

use std::ops::Range;

/// Run `f` over `range`, split recursively into pieces of at most `grain`.
pub fn fork_join<F>(range: Range<usize>, grain: usize, f: &F)
where
    F: Fn(Range<usize>) + Sync,
{
    let len = range.end.saturating_sub(range.start);
    if len == 0 {
        return;
    }
    if len <= grain.max(1) {
        f(range);
        return;
    }
    let mid = range.start + len / 2;
    rayon::join(
        || fork_join(range.start..mid, grain, f),
        || fork_join(mid..range.end, grain, f),
    );
}

/// Row-partitioned fork-join over an output buffer of `out.len() / row_len`
/// rows. Each leaf gets the index of its first row and the disjoint mutable
/// slice holding its rows.
pub fn fork_join_rows<F>(out: &mut [f32], row_len: usize, grain_rows: usize, f: &F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    if row_len == 0 {
        return;
    }
    let rows = out.len() / row_len;
    split_rows(&mut out[..rows * row_len], 0, rows, row_len, grain_rows.max(1), f);
}

fn split_rows<F>(out: &mut [f32], first: usize, rows: usize, row_len: usize, grain: usize, f: &F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    if rows == 0 {
        return;
    }
    if rows <= grain {
        f(first, out);
        return;
    }
    let half = rows / 2;
    let (lo, hi) = out.split_at_mut(half * row_len);
    rayon::join(
        || split_rows(lo, first, half, row_len, grain, f),
        || split_rows(hi, first + half, rows - half, row_len, grain, f),
    );
}

/// Grain that keeps the number of leaves near the pool size, never below
/// `min_grain`.
pub fn bounded_grain(total: usize, min_grain: usize) -> usize {
    let lanes = rayon::current_num_threads().max(1);
    total.div_ceil(lanes).max(min_grain).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fork_join_covers_range_once() {
        let hits: Vec<AtomicUsize> = (0..1000).map(|_| AtomicUsize::new(0)).collect();
        fork_join(0..1000, 7, &|r: Range<usize>| {
            assert!(r.len() <= 7);
            for i in r {
                hits[i].fetch_add(1, Ordering::Relaxed);
            }
        });
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn test_fork_join_rows_disjoint() {
        let mut out = vec![0.0f32; 13 * 3];
        fork_join_rows(&mut out, 3, 2, &|first, block: &mut [f32]| {
            for (local, row) in block.chunks_mut(3).enumerate() {
                row.fill((first + local) as f32);
            }
        });
        for (r, row) in out.chunks(3).enumerate() {
            assert_eq!(row, &[r as f32; 3]);
        }
    }

    #[test]
    fn test_bounded_grain() {
        assert!(bounded_grain(10, 64) >= 64);
        assert_eq!(bounded_grain(0, 0), 1);
    }
}
