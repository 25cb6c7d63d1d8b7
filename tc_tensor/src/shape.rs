//! Shapes, strides and the index arithmetic shared by every operation.

use std::fmt;

use crate::error::{Result, TensorError};

/// Dimensions of a tensor, outermost first. Rank 0 is a scalar.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    pub fn scalar() -> Self {
        Shape(vec![])
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dim(&self, idx: usize) -> usize {
        self.0[idx]
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Element count; a rank-0 shape holds one element.
    pub fn elements(&self) -> usize {
        self.0.iter().product()
    }

    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    /// Size of the last dimension, 1 for a scalar.
    pub fn last(&self) -> usize {
        self.0.last().copied().unwrap_or(1)
    }

    /// Row-major strides.
    pub fn contiguous_strides(&self) -> Strides {
        let mut strides = vec![1usize; self.rank()];
        for i in (0..self.rank().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.0[i + 1];
        }
        Strides(strides)
    }

    /// Fails with `DimensionOutOfBounds` unless `dim < rank`.
    pub fn check_dim(&self, op: &'static str, dim: usize) -> Result<()> {
        if dim >= self.rank() {
            return Err(TensorError::DimensionOutOfBounds {
                op,
                dim,
                rank: self.rank(),
            });
        }
        Ok(())
    }

    /// This shape with dimension `dim` replaced by `size`.
    pub fn with_dim(&self, dim: usize, size: usize) -> Shape {
        let mut dims = self.0.clone();
        dims[dim] = size;
        Shape(dims)
    }

    /// This shape without dimension `dim`.
    pub fn without_dim(&self, dim: usize) -> Shape {
        let mut dims = self.0.clone();
        dims.remove(dim);
        Shape(dims)
    }

    /// Swap the last two dimensions.
    pub fn transposed(&self) -> Shape {
        let mut dims = self.0.clone();
        let r = dims.len();
        if r >= 2 {
            dims.swap(r - 2, r - 1);
        }
        Shape(dims)
    }

    /// Right-aligned broadcast of two shapes: each aligned pair must be
    /// equal or contain a 1; missing leading dims count as 1.
    pub fn broadcast_with(&self, other: &Shape) -> Option<Shape> {
        let rank = self.rank().max(other.rank());
        let pad_a = rank - self.rank();
        let pad_b = rank - other.rank();
        (0..rank)
            .map(|i| {
                let a = if i < pad_a { 1 } else { self.0[i - pad_a] };
                let b = if i < pad_b { 1 } else { other.0[i - pad_b] };
                match (a, b) {
                    _ if a == b => Some(a),
                    (1, _) => Some(b),
                    (_, 1) => Some(a),
                    _ => None,
                }
            })
            .collect::<Option<Vec<_>>>()
            .map(Shape)
    }

    /// Axes of `broadcast_shape` that were expanded to produce it from this
    /// shape: the extra leading axes, then every size-1 axis that grew.
    pub fn reduction_axes_from(&self, broadcast_shape: &Shape) -> Vec<usize> {
        let offset = broadcast_shape.rank() - self.rank();
        let mut axes: Vec<usize> = (0..offset).collect();
        axes.extend(
            (0..self.rank()).filter(|&i| self.0[i] == 1 && broadcast_shape.0[offset + i] != 1).map(|i| offset + i),
        );
        axes
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.0)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        if self.0.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(s: [usize; N]) -> Self {
        Shape(s.to_vec())
    }
}

/// Element step per dimension. A zero stride repeats the same element along
/// that dimension, which is how broadcast views are expressed.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct Strides(pub Vec<usize>);

impl Strides {
    pub fn new(strides: Vec<usize>) -> Self {
        Strides(strides)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Flat offset of a multi-index.
    pub fn offset(&self, index: &[usize]) -> usize {
        debug_assert_eq!(self.0.len(), index.len());
        self.0.iter().zip(index).map(|(s, i)| s * i).sum()
    }

    /// Whether these are the row-major strides of `shape`.
    pub fn is_contiguous(&self, shape: &Shape) -> bool {
        *self == shape.contiguous_strides()
    }
}

/// Decompose a flat row-major position into a multi-index over `dims`.
pub fn unravel(mut flat: usize, dims: &[usize], index: &mut [usize]) {
    for (slot, &d) in index.iter_mut().zip(dims).rev() {
        *slot = flat % d;
        flat /= d;
    }
}
