//! Axis sums, means, scaling and the broadcast/reduce pair used by gradients.

use tc_backend_cpu::{elementwise, split_extents, sum_axis_into};
use tc_backend_device::NdRange;

use super::cfg;
use crate::autograd::{apply, Operation};
use crate::device_kernels::{REDUCE_SUM, SCALE};
use crate::error::{Result, TensorError};
use crate::shape::Shape;
use crate::storage::Storage;
use crate::tensor::Tensor;

impl Tensor {
    /// Sum over `dim`. With `keep_dim` the reduced dimension stays as size 1.
    pub fn sum(&self, dim: usize, keep_dim: bool) -> Result<Tensor> {
        self.shape.check_dim("sum", dim)?;
        let (outer, reduced, inner) = split_extents(self.dims(), dim);
        let shape = if keep_dim {
            self.shape.with_dim(dim, 1)
        } else {
            self.shape.without_dim(dim)
        };
        match &self.storage {
            Storage::Host(src) => {
                let mut out = vec![0.0; outer * inner];
                sum_axis_into(src, &mut out, outer, reduced, inner, cfg());
                Ok(Tensor::host(out, shape))
            }
            Storage::Device(src) => {
                let out = src.zeros(&shape)?;
                out.launch(REDUCE_SUM, NdRange::d1(outer * inner), |launch| {
                    Ok(launch
                        .arg_mem(out.data()?)
                        .arg_mem(src.data()?)
                        .arg_size(outer)
                        .arg_size(reduced)
                        .arg_size(inner))
                })?;
                Ok(Tensor::on_device(out, shape))
            }
        }
    }

    /// Mean over `dim`.
    pub fn mean(&self, dim: usize, keep_dim: bool) -> Result<Tensor> {
        let total = self.sum(dim, keep_dim)?;
        total.scale(1.0 / self.shape.dim(dim) as f32)
    }

    /// Sum of every element, as a rank-0 tensor.
    pub fn sum_all(&self) -> Result<Tensor> {
        self.reshape([self.elements()])?.sum(0, false)
    }

    /// Reduce a broadcast result back to `target` by summing the expanded
    /// axes. `target` must broadcast to this tensor's shape.
    pub fn sum_to(&self, target: &Shape) -> Result<Tensor> {
        if *target == self.shape {
            return Ok(self.detach());
        }
        if target.broadcast_with(&self.shape).as_ref() != Some(&self.shape) {
            return Err(TensorError::ShapeMismatch {
                op: "sum_to",
                lhs: self.shape.clone(),
                rhs: target.clone(),
            });
        }
        let mut acc = self.detach();
        for axis in target.reduction_axes_from(&self.shape) {
            acc = acc.sum(axis, true)?;
        }
        acc.reshape(target.clone())
    }

    /// Repeat this tensor along broadcast axes to fill `shape`.
    pub fn expand_to(&self, shape: &Shape) -> Result<Tensor> {
        if self.shape.broadcast_with(shape).as_ref() != Some(shape) {
            return Err(TensorError::ShapeMismatch {
                op: "expand",
                lhs: self.shape.clone(),
                rhs: shape.clone(),
            });
        }
        self.zeros_like_placed(shape.clone())?.add(self)
    }

    /// Multiply every element by `alpha`.
    pub fn scale(&self, alpha: f32) -> Result<Tensor> {
        match &self.storage {
            Storage::Host(src) => Ok(Tensor::host(elementwise::map(src, |x| x * alpha, cfg()), self.shape.clone())),
            Storage::Device(src) => {
                let out = src.zeros(&self.shape)?;
                out.launch(SCALE, NdRange::d1(self.elements()), |launch| {
                    Ok(launch.arg_mem(out.data()?).arg_mem(src.data()?).arg_float(alpha))
                })?;
                Ok(Tensor::on_device(out, self.shape.clone()))
            }
        }
    }

    pub fn sum_with_grad(&self, dim: usize, keep_dim: bool) -> Result<Tensor> {
        apply(SumOp { dim, keep_dim }, &[self])
    }

    pub fn mean_with_grad(&self, dim: usize, keep_dim: bool) -> Result<Tensor> {
        apply(MeanOp { dim, keep_dim }, &[self])
    }

    pub fn sum_all_with_grad(&self) -> Result<Tensor> {
        self.reshape_with_grad([self.elements()])?.sum_with_grad(0, false)
    }

    pub fn scale_with_grad(&self, alpha: f32) -> Result<Tensor> {
        apply(ScaleOp(alpha), &[self])
    }
}

/// Spread an axis-reduction gradient back over the reduced axis.
fn expand_reduced(grad: &Tensor, input: &Tensor, dim: usize) -> Result<Tensor> {
    grad.reshape(input.shape().with_dim(dim, 1))?.expand_to(input.shape())
}

#[derive(Debug, Clone, Copy)]
pub struct SumOp {
    pub dim: usize,
    pub keep_dim: bool,
}

impl Operation for SumOp {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn required_inputs(&self) -> usize {
        1
    }

    fn compute(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        inputs[0].sum(self.dim, self.keep_dim)
    }

    fn backward(&self, grad: &Tensor, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        Ok(vec![expand_reduced(grad, &inputs[0], self.dim)?])
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MeanOp {
    pub dim: usize,
    pub keep_dim: bool,
}

impl Operation for MeanOp {
    fn name(&self) -> &'static str {
        "mean"
    }

    fn required_inputs(&self) -> usize {
        1
    }

    fn compute(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        inputs[0].mean(self.dim, self.keep_dim)
    }

    fn backward(&self, grad: &Tensor, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let n = inputs[0].shape().dim(self.dim) as f32;
        Ok(vec![expand_reduced(grad, &inputs[0], self.dim)?.scale(1.0 / n)?])
    }
}

/// Multiplication by a constant.
#[derive(Debug, Clone, Copy)]
pub struct ScaleOp(pub f32);

impl Operation for ScaleOp {
    fn name(&self) -> &'static str {
        "scale"
    }

    fn required_inputs(&self) -> usize {
        1
    }

    fn compute(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        inputs[0].scale(self.0)
    }

    fn backward(&self, grad: &Tensor, _inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        Ok(vec![grad.scale(self.0)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(data: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape).unwrap()
    }

    #[test]
    fn test_sum_axes() {
        let a = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let s = a.sum(0, false).unwrap();
        assert_eq!(s.shape(), &Shape::from([2]));
        assert_eq!(s.to_vec().unwrap(), vec![4.0, 6.0]);
        let k = a.sum(1, true).unwrap();
        assert_eq!(k.shape(), &Shape::from([2, 1]));
        assert_eq!(k.to_vec().unwrap(), vec![3.0, 7.0]);
        assert!(matches!(a.sum(2, false), Err(TensorError::DimensionOutOfBounds { op: "sum", .. })));
    }

    #[test]
    fn test_mean_and_sum_all() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        assert_eq!(a.mean(1, false).unwrap().to_vec().unwrap(), vec![2.0, 5.0]);
        let total = a.sum_all().unwrap();
        assert!(total.shape().is_scalar());
        assert_eq!(total.to_vec().unwrap(), vec![21.0]);
    }

    #[test]
    fn test_sum_to_reduces_broadcast_axes() {
        let g = Tensor::ones([2, 3, 4]);
        assert_eq!(g.sum_to(&Shape::from([4])).unwrap().to_vec().unwrap(), vec![6.0; 4]);
        let col = g.sum_to(&Shape::from([3, 1])).unwrap();
        assert_eq!(col.shape(), &Shape::from([3, 1]));
        assert_eq!(col.to_vec().unwrap(), vec![8.0; 3]);
        assert_eq!(g.sum_to(&Shape::scalar()).unwrap().to_vec().unwrap(), vec![24.0]);
        assert!(matches!(g.sum_to(&Shape::from([5])), Err(TensorError::ShapeMismatch { op: "sum_to", .. })));
    }

    #[test]
    fn test_expand_to() {
        let row = t(&[1.0, 2.0], &[2]);
        let e = row.expand_to(&Shape::from([2, 2])).unwrap();
        assert_eq!(e.to_vec().unwrap(), vec![1.0, 2.0, 1.0, 2.0]);
        assert!(row.expand_to(&Shape::from([3])).is_err());
    }

    #[test]
    fn test_reduction_gradients() {
        let a = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]).track_grad();
        a.mean_with_grad(0, false).unwrap().backward().unwrap();
        assert_eq!(a.grad().unwrap().to_vec().unwrap(), vec![0.5; 4]);

        let b = t(&[1.0, 2.0, 3.0], &[3]).track_grad();
        b.scale_with_grad(3.0).unwrap().sum_all_with_grad().unwrap().backward().unwrap();
        assert_eq!(b.grad().unwrap().to_vec().unwrap(), vec![3.0; 3]);
    }
}
