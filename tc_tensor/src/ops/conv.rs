//! Valid 2-D convolution, stride 1, no padding.
//!
//! Inputs are `[C, H, W]` or `[N, C, H, W]`; filters are `[F, C, kh, kw]`.

use tc_backend_cpu::{conv, elementwise, BinaryOp, ConvDims};
use tc_backend_device::NdRange;

use super::cfg;
use crate::autograd::{apply, Operation};
use crate::device_kernels::{CONV2D, CONV2D_FILTER_GRAD, CONV2D_INPUT_GRAD};
use crate::error::{Result, TensorError};
use crate::shape::Shape;
use crate::storage::{placement_mismatch, Storage};
use crate::tensor::Tensor;

/// Apply `f` to each of `batch` consecutive `in_len`-element images and
/// concatenate the results.
pub(crate) fn conv_batch<F>(x: &[f32], in_len: usize, batch: usize, f: F) -> Option<Vec<f32>>
where
    F: Fn(&[f32]) -> Vec<f32>,
{
    if in_len == 0 || x.len() != in_len * batch {
        return None;
    }
    Some(x.chunks_exact(in_len).flat_map(f).collect())
}

/// Filter gradient summed over the batch.
pub(crate) fn conv_filter_grad_batch(input: &[f32], grad_out: &[f32], dims: ConvDims, batch: usize) -> Option<Vec<f32>> {
    if input.len() != dims.input_len() * batch || grad_out.len() != dims.output_len() * batch {
        return None;
    }
    let mut total = vec![0.0; dims.filter_len()];
    let pairs = input.chunks_exact(dims.input_len()).zip(grad_out.chunks_exact(dims.output_len()));
    for (image, grad) in pairs {
        let g = conv::conv2d_filter_grad(image, grad, dims, cfg());
        elementwise::binary_assign(BinaryOp::Add, &mut total, &g, cfg());
    }
    Some(total)
}

/// Geometry, batch size and output shape for `input ⋆ filters`.
fn plan(input: &Shape, filters: &Shape) -> Result<(ConvDims, usize, Shape)> {
    let mismatch = || TensorError::ShapeMismatch {
        op: "conv2d",
        lhs: input.clone(),
        rhs: filters.clone(),
    };
    let (batch, image) = match input.dims() {
        [c, h, w] => (None, [*c, *h, *w]),
        [n, c, h, w] => (Some(*n), [*c, *h, *w]),
        _ => return Err(mismatch()),
    };
    let [f, fc, kh, kw] = match filters.dims() {
        &[f, fc, kh, kw] => [f, fc, kh, kw],
        _ => return Err(mismatch()),
    };
    let dims = ConvDims {
        channels: image[0],
        height: image[1],
        width: image[2],
        filters: f,
        kernel_h: kh,
        kernel_w: kw,
    };
    if fc != dims.channels || !dims.is_valid() {
        return Err(mismatch());
    }
    let out = match batch {
        Some(n) => Shape::from([n, f, dims.out_h(), dims.out_w()]),
        None => Shape::from([f, dims.out_h(), dims.out_w()]),
    };
    Ok((dims, batch.unwrap_or(1), out))
}

/// Run one convolution pass: `host` on host buffers, `kernel` on device
/// buffers. Both see `(x, y)` in the same order.
fn conv_pass<F>(
    kernel: &'static str,
    x: &Tensor,
    y: &Tensor,
    dims: ConvDims,
    batch: usize,
    out_shape: Shape,
    host: F,
) -> Result<Tensor>
where
    F: FnOnce(&[f32], &[f32]) -> Option<Vec<f32>>,
{
    match (&x.storage, &y.storage) {
        (Storage::Host(a), Storage::Host(b)) => {
            let out = host(a, b).ok_or_else(|| TensorError::ShapeMismatch {
                op: "conv2d",
                lhs: x.shape().clone(),
                rhs: y.shape().clone(),
            })?;
            Ok(Tensor::host(out, out_shape))
        }
        (Storage::Device(a), Storage::Device(b)) => {
            a.check_same("conv2d", b)?;
            let out = a.zeros(&out_shape)?;
            out.launch(kernel, NdRange::d2(batch, dims.filters), |launch| {
                Ok(launch
                    .arg_mem(out.data()?)
                    .arg_mem(a.data()?)
                    .arg_mem(b.data()?)
                    .arg_size(batch)
                    .arg_size(dims.channels)
                    .arg_size(dims.height)
                    .arg_size(dims.width)
                    .arg_size(dims.filters)
                    .arg_size(dims.kernel_h)
                    .arg_size(dims.kernel_w))
            })?;
            Ok(Tensor::on_device(out, out_shape))
        }
        (lhs, rhs) => Err(placement_mismatch("conv2d", lhs, rhs)),
    }
}

impl Tensor {
    /// Correlate `self` with a filter bank.
    pub fn conv2d(&self, filters: &Tensor) -> Result<Tensor> {
        let (dims, batch, out_shape) = plan(&self.shape, &filters.shape)?;
        conv_pass(CONV2D, self, filters, dims, batch, out_shape, |x, w| {
            conv_batch(x, dims.input_len(), batch, |img| conv::conv2d(img, w, dims, cfg()))
        })
    }

    pub fn conv2d_with_grad(&self, filters: &Tensor) -> Result<Tensor> {
        apply(Conv2dOp, &[self, filters])
    }
}

/// `out = x ⋆ w`; `dx` is the full correlation of `dout` with the flipped
/// filters and `dw` the correlation of `x` with `dout`, summed over the batch.
#[derive(Debug, Clone, Copy)]
pub struct Conv2dOp;

impl Operation for Conv2dOp {
    fn name(&self) -> &'static str {
        "conv2d"
    }

    fn compute(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        inputs[0].conv2d(inputs[1])
    }

    fn backward(&self, grad: &Tensor, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let (x, w) = (&inputs[0], &inputs[1]);
        let (dims, batch, out_shape) = plan(x.shape(), w.shape())?;
        if *grad.shape() != out_shape {
            return Err(TensorError::ShapeMismatch {
                op: "conv2d",
                lhs: grad.shape().clone(),
                rhs: out_shape,
            });
        }
        let dx = conv_pass(CONV2D_INPUT_GRAD, grad, w, dims, batch, x.shape().clone(), |g, w| {
            conv_batch(g, dims.output_len(), batch, |plane| conv::conv2d_input_grad(plane, w, dims, cfg()))
        })?;
        let dw = conv_pass(CONV2D_FILTER_GRAD, x, grad, dims, batch, w.shape().clone(), |x, g| {
            conv_filter_grad_batch(x, g, dims, batch)
        })?;
        Ok(vec![dx, dw])
    }
}
