//! Transpose, reshape, slice and concat.

use std::ops::Range;

use tc_backend_device::NdRange;

use super::cfg;
use crate::autograd::{apply, Operation};
use crate::device_kernels::{SLICE_EXTRACT, SLICE_INSERT, TRANSPOSE};
use crate::error::{Result, TensorError};
use crate::region::{self, region_shape, resolve_ranges};
use crate::shape::Shape;
use crate::storage::{placement_mismatch, Storage};
use crate::tensor::Tensor;

impl Tensor {
    /// Swap the last two dimensions.
    pub fn transpose(&self) -> Result<Tensor> {
        let rank = self.rank();
        if rank < 2 {
            return Err(TensorError::DimensionOutOfBounds {
                op: "transpose",
                dim: 1,
                rank,
            });
        }
        let (rows, cols) = (self.shape.dim(rank - 2), self.shape.dim(rank - 1));
        let batch = self.shape.dims()[..rank - 2].iter().product();
        let shape = self.shape.transposed();
        match &self.storage {
            Storage::Host(src) => Ok(Tensor::host(tc_backend_cpu::transpose(src, batch, rows, cols, cfg()), shape)),
            Storage::Device(src) => {
                let out = src.zeros(&shape)?;
                out.launch(TRANSPOSE, NdRange::d3(batch, cols, rows), |launch| {
                    Ok(launch
                        .arg_mem(out.data()?)
                        .arg_mem(src.data()?)
                        .arg_size(batch)
                        .arg_size(rows)
                        .arg_size(cols))
                })?;
                Ok(Tensor::on_device(out, shape))
            }
        }
    }

    /// Same elements under a new shape with the same element count. Shares
    /// storage with `self`.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        if shape.elements() != self.elements() {
            return Err(TensorError::ElementCount {
                expected: shape.elements(),
                found: self.elements(),
                shape,
            });
        }
        let storage = match &self.storage {
            Storage::Host(data) => Storage::Host(data.clone()),
            Storage::Device(d) => Storage::Device(d.view(&shape)?),
        };
        Ok(Tensor::from_parts(shape, storage))
    }

    /// Sub-tensor selected by one range per leading dimension; dimensions
    /// without a range are kept whole.
    pub fn slice(&self, ranges: &[Range<usize>]) -> Result<Tensor> {
        let ranges = resolve_ranges("slice", &self.shape, ranges)?;
        self.extract(&ranges)
    }

    fn extract(&self, ranges: &[Range<usize>]) -> Result<Tensor> {
        let shape = region_shape(ranges);
        match &self.storage {
            Storage::Host(src) => Ok(Tensor::host(region::extract(src, &self.shape, ranges)?, shape)),
            Storage::Device(src) => {
                let bounds: Vec<usize> = ranges.iter().flat_map(|r| [r.start, r.end]).collect();
                let bounds = src.upload_indices(&bounds)?;
                let out = src.zeros(&shape)?;
                out.launch(SLICE_EXTRACT, NdRange::d1(shape.elements()), |launch| {
                    Ok(launch
                        .arg_mem(out.data()?)
                        .arg_mem(src.data()?)
                        .arg_mem(src.shape_buf()?)
                        .arg_mem(bounds.handle()))
                })?;
                bounds.close();
                Ok(Tensor::on_device(out, shape))
            }
        }
    }

    /// Write `src` into `self` with its origin at `offsets`.
    pub(crate) fn insert_region(&mut self, src: &Tensor, offsets: &[usize]) -> Result<()> {
        match (&mut self.storage, &src.storage) {
            (Storage::Host(dst), Storage::Host(data)) => {
                region::insert(std::sync::Arc::make_mut(dst).as_mut_slice(), &self.shape, data, &src.shape, offsets)
            }
            (Storage::Device(dst), Storage::Device(data)) => {
                dst.check_same("insert", data)?;
                let offsets = dst.upload_indices(offsets)?;
                dst.launch(SLICE_INSERT, NdRange::d1(src.elements()), |launch| {
                    Ok(launch
                        .arg_mem(dst.data()?)
                        .arg_mem(dst.shape_buf()?)
                        .arg_mem(data.data()?)
                        .arg_mem(data.shape_buf()?)
                        .arg_mem(offsets.handle()))
                })?;
                offsets.close();
                Ok(())
            }
            (lhs, rhs) => Err(placement_mismatch("insert", lhs, rhs)),
        }
    }

    /// Join `self` and `other` along `dim`. All other dimensions must agree.
    pub fn concat(&self, other: &Tensor, dim: usize) -> Result<Tensor> {
        self.shape.check_dim("concat", dim)?;
        let compatible = self.rank() == other.rank()
            && self
                .dims()
                .iter()
                .zip(other.dims())
                .enumerate()
                .all(|(d, (a, b))| d == dim || a == b);
        if !compatible {
            return Err(TensorError::ShapeMismatch {
                op: "concat",
                lhs: self.shape.clone(),
                rhs: other.shape.clone(),
            });
        }
        let split = self.shape.dim(dim);
        let mut out = self.zeros_like_placed(self.shape.with_dim(dim, split + other.shape.dim(dim)))?;
        let mut offsets = vec![0; self.rank()];
        out.insert_region(self, &offsets)?;
        offsets[dim] = split;
        out.insert_region(other, &offsets)?;
        Ok(out)
    }

    /// [`concat`](Tensor::concat) along the last dimension.
    pub fn concat_last(&self, other: &Tensor) -> Result<Tensor> {
        self.concat(other, self.rank().saturating_sub(1))
    }

    pub fn transpose_with_grad(&self) -> Result<Tensor> {
        apply(TransposeOp, &[self])
    }

    pub fn reshape_with_grad(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        apply(ReshapeOp(shape.into()), &[self])
    }

    pub fn slice_with_grad(&self, ranges: &[Range<usize>]) -> Result<Tensor> {
        let ranges = resolve_ranges("slice", &self.shape, ranges)?;
        apply(SliceOp { ranges }, &[self])
    }

    pub fn concat_with_grad(&self, other: &Tensor, dim: usize) -> Result<Tensor> {
        apply(ConcatOp { dim: Some(dim) }, &[self, other])
    }
}

/// Swap of the last two dimensions; the gradient is swapped back.
#[derive(Debug, Clone, Copy)]
pub struct TransposeOp;

impl Operation for TransposeOp {
    fn name(&self) -> &'static str {
        "transpose"
    }

    fn required_inputs(&self) -> usize {
        1
    }

    fn compute(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        inputs[0].transpose()
    }

    fn backward(&self, grad: &Tensor, _inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        Ok(vec![grad.transpose()?])
    }
}

#[derive(Debug, Clone)]
pub struct ReshapeOp(pub Shape);

impl Operation for ReshapeOp {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn required_inputs(&self) -> usize {
        1
    }

    fn compute(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        inputs[0].reshape(self.0.clone())
    }

    fn backward(&self, grad: &Tensor, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        Ok(vec![grad.reshape(inputs[0].shape().clone())?])
    }
}

/// Region selection. The gradient is zero outside the selected region.
#[derive(Debug, Clone)]
pub struct SliceOp {
    /// One resolved range per dimension.
    pub ranges: Vec<Range<usize>>,
}

impl Operation for SliceOp {
    fn name(&self) -> &'static str {
        "slice"
    }

    fn required_inputs(&self) -> usize {
        1
    }

    fn compute(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        let ranges = resolve_ranges("slice", inputs[0].shape(), &self.ranges)?;
        inputs[0].extract(&ranges)
    }

    fn backward(&self, grad: &Tensor, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let mut full = grad.zeros_like_placed(inputs[0].shape().clone())?;
        let offsets: Vec<usize> = self.ranges.iter().map(|r| r.start).collect();
        full.insert_region(grad, &offsets)?;
        Ok(vec![full])
    }
}

/// Concatenation along `dim`, or the last dimension when `None`. The
/// gradient is split back into the two contributing ranges.
#[derive(Debug, Clone, Copy)]
pub struct ConcatOp {
    pub dim: Option<usize>,
}

impl ConcatOp {
    fn dim_for(&self, input: &Tensor) -> usize {
        self.dim.unwrap_or(input.rank().saturating_sub(1))
    }
}

impl Operation for ConcatOp {
    fn name(&self) -> &'static str {
        "concat"
    }

    fn compute(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        inputs[0].concat(inputs[1], self.dim_for(inputs[0]))
    }

    fn backward(&self, grad: &Tensor, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let dim = self.dim_for(&inputs[0]);
        grad.shape().check_dim("concat", dim)?;
        let split = inputs[0].shape().dim(dim);
        let mut first = vec![0..0; dim + 1];
        let mut second = first.clone();
        for d in 0..dim {
            first[d] = 0..grad.shape().dim(d);
            second[d] = 0..grad.shape().dim(d);
        }
        first[dim] = 0..split;
        second[dim] = split..grad.shape().dim(dim);
        Ok(vec![grad.slice(&first)?, grad.slice(&second)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(shape: &[usize]) -> Tensor {
        let n = shape.iter().product::<usize>();
        Tensor::from_vec((0..n).map(|x| x as f32).collect(), shape).unwrap()
    }

    #[test]
    fn test_transpose() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], [2, 2]).unwrap();
        assert_eq!(t.transpose().unwrap().to_vec().unwrap(), vec![1.0, 3.0, 2.0, 4.0]);
        let b = grid(&[2, 2, 3]).transpose().unwrap();
        assert_eq!(b.shape(), &Shape::from([2, 3, 2]));
        assert_eq!(b.get(&[1, 2, 0]).unwrap(), 8.0);
        assert!(matches!(
            Tensor::ones([3]).transpose(),
            Err(TensorError::DimensionOutOfBounds { op: "transpose", .. })
        ));
    }

    #[test]
    fn test_reshape_shares_host_buffer() {
        let t = grid(&[2, 3]);
        let r = t.reshape([3, 2]).unwrap();
        assert_eq!(r.get(&[2, 1]).unwrap(), 5.0);
        assert_eq!(r.as_slice().unwrap().as_ptr(), t.as_slice().unwrap().as_ptr());
        assert!(matches!(t.reshape([4]), Err(TensorError::ElementCount { .. })));
    }

    #[test]
    fn test_slice_and_concat() {
        let a = grid(&[2, 3]);
        let b = grid(&[2, 1]);
        let c = a.concat(&b, 1).unwrap();
        assert_eq!(c.to_vec().unwrap(), vec![0.0, 1.0, 2.0, 0.0, 3.0, 4.0, 5.0, 1.0]);
        assert_eq!(c.slice(&[0..2, 0..3]).unwrap().to_vec().unwrap(), a.to_vec().unwrap());
        assert_eq!(c.slice(&[0..2, 3..4]).unwrap().to_vec().unwrap(), b.to_vec().unwrap());
        assert_eq!(a.slice(&[1..2]).unwrap().to_vec().unwrap(), vec![3.0, 4.0, 5.0]);

        assert!(matches!(a.concat(&b, 0), Err(TensorError::ShapeMismatch { op: "concat", .. })));
        assert!(matches!(a.concat(&b, 2), Err(TensorError::DimensionOutOfBounds { .. })));
        assert!(matches!(a.slice(&[0..3]), Err(TensorError::InvalidRange { .. })));
    }

    #[test]
    fn test_slice_gradient_is_zero_outside() {
        let a = grid(&[2, 3]).track_grad();
        a.slice_with_grad(&[1..2, 1..3]).unwrap().backward().unwrap();
        assert_eq!(a.grad().unwrap().to_vec().unwrap(), vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_concat_gradient_splits() {
        let a = grid(&[2, 2]).track_grad();
        let b = grid(&[1, 2]).track_grad();
        let c = a.concat_with_grad(&b, 0).unwrap();
        let seed = grid(&[3, 2]);
        c.backward_with(seed).unwrap();
        assert_eq!(a.grad().unwrap().to_vec().unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(b.grad().unwrap().to_vec().unwrap(), vec![4.0, 5.0]);
    }

    #[test]
    fn test_transpose_and_reshape_gradients() {
        let a = grid(&[2, 3]).track_grad();
        let t = a.transpose_with_grad().unwrap();
        let r = t.reshape_with_grad([6]).unwrap();
        r.backward_with(grid(&[6])).unwrap();
        // r[i] = a^T flattened, so da = reshape(seed, [3, 2])^T
        assert_eq!(a.grad().unwrap().to_vec().unwrap(), vec![0.0, 2.0, 4.0, 1.0, 3.0, 5.0]);
    }
}
