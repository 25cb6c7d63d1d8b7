//! Copying rectangular sub-regions in and out of row-major buffers.
//!
//! Used by slicing, concatenation and their gradients. Copies are done one
//! innermost row at a time.

use std::ops::Range;

use crate::error::{Result, TensorError};
use crate::shape::{unravel, Shape};
use crate::view::TensorView;

/// Resolve per-dimension ranges against `shape`. Missing trailing ranges
/// cover the whole dimension.
pub fn resolve_ranges(op: &'static str, shape: &Shape, ranges: &[Range<usize>]) -> Result<Vec<Range<usize>>> {
    if ranges.len() > shape.rank() {
        return Err(TensorError::DimensionOutOfBounds {
            op,
            dim: ranges.len() - 1,
            rank: shape.rank(),
        });
    }
    shape
        .dims()
        .iter()
        .enumerate()
        .map(|(dim, &size)| match ranges.get(dim) {
            Some(r) if r.start > r.end || r.end > size => Err(TensorError::InvalidRange {
                op,
                dim,
                start: r.start,
                end: r.end,
                size,
            }),
            Some(r) => Ok(r.clone()),
            None => Ok(0..size),
        })
        .collect()
}

/// Shape of the region selected by resolved `ranges`.
pub fn region_shape(ranges: &[Range<usize>]) -> Shape {
    Shape(ranges.iter().map(|r| r.len()).collect())
}

/// Copy the region `ranges` of `src` out into a new buffer.
pub fn extract(src: &[f32], src_shape: &Shape, ranges: &[Range<usize>]) -> Result<Vec<f32>> {
    let mut view = TensorView::new(src, src_shape.clone())?;
    for (dim, r) in ranges.iter().enumerate() {
        view = view.narrow(dim, r.clone())?;
    }
    Ok(view.to_contiguous())
}

/// Write `src` into `dst` with its origin at `offsets`.
pub fn insert(dst: &mut [f32], dst_shape: &Shape, src: &[f32], src_shape: &Shape, offsets: &[usize]) -> Result<()> {
    let mismatch = || TensorError::ShapeMismatch {
        op: "insert",
        lhs: dst_shape.clone(),
        rhs: src_shape.clone(),
    };
    if src_shape.rank() != dst_shape.rank() || offsets.len() != dst_shape.rank() {
        return Err(mismatch());
    }
    let fits = src_shape
        .dims()
        .iter()
        .zip(offsets)
        .zip(dst_shape.dims())
        .all(|((&s, &o), &d)| o + s <= d);
    if !fits || src.len() != src_shape.elements() || dst.len() != dst_shape.elements() {
        return Err(mismatch());
    }
    if src.is_empty() {
        return Ok(());
    }

    let row = src_shape.last();
    let dst_strides = dst_shape.contiguous_strides();
    let mut index = vec![0; src_shape.rank()];
    for (r, chunk) in src.chunks_exact(row).enumerate() {
        unravel(r * row, src_shape.dims(), &mut index);
        for (i, o) in index.iter_mut().zip(offsets) {
            *i += o;
        }
        let start = dst_strides.offset(&index);
        dst[start..start + row].copy_from_slice(chunk);
    }
    Ok(())
}
