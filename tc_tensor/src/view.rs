//! Non-owning strided views over host buffers.
//!
//! A view reinterprets a flat buffer through a shape, per-dimension strides
//! and a starting offset. Transposition, narrowing and broadcasting only
//! rewrite that metadata; [`TensorView::to_contiguous`] materializes.

use std::ops::Range;

use crate::error::{Result, TensorError};
use crate::shape::{unravel, Shape, Strides};

#[derive(Debug, Clone)]
pub struct TensorView<'a> {
    data: &'a [f32],
    shape: Shape,
    strides: Strides,
    offset: usize,
}

impl<'a> TensorView<'a> {
    /// Row-major view of `data` as `shape`.
    pub fn new(data: &'a [f32], shape: Shape) -> Result<Self> {
        if data.len() != shape.elements() {
            return Err(TensorError::ElementCount {
                expected: shape.elements(),
                found: data.len(),
                shape,
            });
        }
        let strides = shape.contiguous_strides();
        Ok(Self {
            data,
            shape,
            strides,
            offset: 0,
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &Strides {
        &self.strides
    }

    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides.is_contiguous(&self.shape) && self.data.len() == self.shape.elements()
    }

    /// Element at a multi-index. Panics when out of range.
    pub fn at(&self, index: &[usize]) -> f32 {
        self.data[self.offset + self.strides.offset(index)]
    }

    /// Swap the last two dimensions.
    pub fn transposed(&self) -> Result<Self> {
        let rank = self.shape.rank();
        if rank < 2 {
            return Err(TensorError::DimensionOutOfBounds {
                op: "transpose",
                dim: 1,
                rank,
            });
        }
        let mut strides = self.strides.clone();
        strides.0.swap(rank - 2, rank - 1);
        Ok(Self {
            data: self.data,
            shape: self.shape.transposed(),
            strides,
            offset: self.offset,
        })
    }

    /// Restrict dimension `dim` to `range`.
    pub fn narrow(&self, dim: usize, range: Range<usize>) -> Result<Self> {
        self.shape.check_dim("narrow", dim)?;
        let size = self.shape.dim(dim);
        if range.start > range.end || range.end > size {
            return Err(TensorError::InvalidRange {
                op: "narrow",
                dim,
                start: range.start,
                end: range.end,
                size,
            });
        }
        Ok(Self {
            data: self.data,
            shape: self.shape.with_dim(dim, range.len()),
            strides: self.strides.clone(),
            offset: self.offset + range.start * self.strides.0[dim],
        })
    }

    /// Expand to `target` by right-aligning dimensions. Size-1 and missing
    /// leading dimensions get stride zero.
    pub fn broadcast_to(&self, target: &Shape) -> Result<Self> {
        let mismatch = || TensorError::ShapeMismatch {
            op: "broadcast",
            lhs: self.shape.clone(),
            rhs: target.clone(),
        };
        if target.rank() < self.shape.rank() {
            return Err(mismatch());
        }
        let pad = target.rank() - self.shape.rank();
        let mut strides = vec![0; target.rank()];
        for (i, &size) in self.shape.dims().iter().enumerate() {
            let want = target.dim(pad + i);
            if size == want {
                strides[pad + i] = self.strides.0[i];
            } else if size != 1 {
                return Err(mismatch());
            }
        }
        Ok(Self {
            data: self.data,
            shape: target.clone(),
            strides: Strides(strides),
            offset: self.offset,
        })
    }

    /// Copy the viewed elements out in row-major order.
    pub fn to_contiguous(&self) -> Vec<f32> {
        let n = self.shape.elements();
        if self.is_contiguous() {
            return self.data.to_vec();
        }
        let dims = self.shape.dims();
        let mut index = vec![0; dims.len()];
        (0..n)
            .map(|flat| {
                unravel(flat, dims, &mut index);
                self.at(&index)
            })
            .collect()
    }
}
