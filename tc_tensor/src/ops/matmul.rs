//! Batched matrix multiply.

use tc_backend_cpu::MatmulDims;
use tc_backend_device::NdRange;
use tracing::instrument;

use super::cfg;
use crate::autograd::{apply, Operation};
use crate::device_kernels::MATMUL;
use crate::error::{Result, TensorError};
use crate::shape::Shape;
use crate::storage::{placement_mismatch, Storage};
use crate::tensor::Tensor;

/// Kernel geometry and output shape for `a @ b`.
///
/// `a` is `[..., m, n]`. `b` is either `[..., n, p]` with the same leading
/// dimensions, or a single `[n, p]` matrix shared across `a`'s batch.
fn plan(a: &Shape, b: &Shape) -> Result<(MatmulDims, Shape)> {
    let mismatch = || TensorError::ShapeMismatch {
        op: "matmul",
        lhs: a.clone(),
        rhs: b.clone(),
    };
    let (ra, rb) = (a.rank(), b.rank());
    if ra < 2 || rb < 2 {
        return Err(mismatch());
    }
    let (m, n) = (a.dim(ra - 2), a.dim(ra - 1));
    let (k, p) = (b.dim(rb - 2), b.dim(rb - 1));
    if n != k {
        return Err(mismatch());
    }
    let lead = &a.dims()[..ra - 2];
    let batch = lead.iter().product();
    let dims = if rb == 2 {
        MatmulDims::new(batch, m, n, p).shared_rhs()
    } else if lead == &b.dims()[..rb - 2] {
        MatmulDims::new(batch, m, n, p)
    } else {
        return Err(mismatch());
    };
    let mut out = lead.to_vec();
    out.extend([m, p]);
    Ok((dims, Shape(out)))
}

impl Tensor {
    /// `op(self) · op(other)` with the given kernel geometry, into a fresh
    /// zeroed output of `out_shape`.
    pub(crate) fn matmul_raw(&self, other: &Tensor, dims: MatmulDims, trans_a: bool, trans_b: bool, out_shape: Shape) -> Result<Tensor> {
        match (&self.storage, &other.storage) {
            (Storage::Host(a), Storage::Host(b)) => {
                let c = tc_backend_cpu::matmul(a, b, dims, trans_a, trans_b, cfg());
                Ok(Tensor::host(c, out_shape))
            }
            (Storage::Device(a), Storage::Device(b)) => {
                a.check_same("matmul", b)?;
                let out = a.zeros(&out_shape)?;
                out.launch(MATMUL, NdRange::d2(dims.rows(), dims.p), |launch| {
                    Ok(launch
                        .arg_mem(out.data()?)
                        .arg_mem(a.data()?)
                        .arg_mem(b.data()?)
                        .arg_size(dims.batch)
                        .arg_size(dims.m)
                        .arg_size(dims.n)
                        .arg_size(dims.p)
                        .arg_int(i64::from(dims.b_batched))
                        .arg_int(i64::from(trans_a))
                        .arg_int(i64::from(trans_b)))
                })?;
                Ok(Tensor::on_device(out, out_shape))
            }
            (lhs, rhs) => Err(placement_mismatch("matmul", lhs, rhs)),
        }
    }

    /// Matrix product over the last two dimensions.
    #[instrument(level = "trace", skip_all, fields(lhs = %self.shape, rhs = %other.shape))]
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        let (dims, shape) = plan(&self.shape, &other.shape)?;
        self.matmul_raw(other, dims, false, false, shape)
    }

    pub fn matmul_with_grad(&self, other: &Tensor) -> Result<Tensor> {
        apply(MatMulOp, &[self, other])
    }
}

/// `C = A @ B`; `dA = dC @ Bᵗ`, `dB = Aᵗ @ dC`.
///
/// Neither transpose is materialized: both gradients run the kernel with
/// the matching transposed layout flag.
#[derive(Debug, Clone, Copy)]
pub struct MatMulOp;

impl Operation for MatMulOp {
    fn name(&self) -> &'static str {
        "matmul"
    }

    fn compute(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        inputs[0].matmul(inputs[1])
    }

    fn backward(&self, grad: &Tensor, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let (a, b) = (&inputs[0], &inputs[1]);
        let (dims, _) = plan(a.shape(), b.shape())?;
        let (batch, m, n, p) = (dims.batch, dims.m, dims.n, dims.p);

        // [m, p] @ [p, n] per batch, reading B's [n, p] storage transposed.
        let mut da_dims = MatmulDims::new(batch, m, p, n);
        if !dims.b_batched {
            da_dims = da_dims.shared_rhs();
        }
        let da = grad.matmul_raw(b, da_dims, false, true, a.shape().clone())?;

        // [n, m] @ [m, p], reading A's [m, n] storage transposed. A shared B
        // collects every batch at once by treating the batch as extra rows.
        let db_dims = if dims.b_batched {
            MatmulDims::new(batch, n, m, p)
        } else {
            MatmulDims::new(1, n, batch * m, p)
        };
        let db = a.matmul_raw(grad, db_dims, true, false, b.shape().clone())?;
        Ok(vec![da, db])
    }
}
