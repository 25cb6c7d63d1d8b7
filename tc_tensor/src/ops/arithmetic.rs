//! Broadcasting add, sub, mul, div.

use std::sync::Arc;

use tc_backend_cpu::BinaryOp;
use tc_backend_device::NdRange;

use super::cfg;
use crate::autograd::{apply, Operation};
use crate::broadcast::{broadcast_assign, broadcast_binary, broadcast_shape, op_name};
use crate::device_kernels::BINARY;
use crate::error::{Result, TensorError};
use crate::storage::{placement_mismatch, Storage};
use crate::tensor::Tensor;

impl Tensor {
    fn binary(&self, op: BinaryOp, other: &Tensor) -> Result<Tensor> {
        match (&self.storage, &other.storage) {
            (Storage::Host(a), Storage::Host(b)) => {
                let (data, shape) = broadcast_binary(op, a, &self.shape, b, &other.shape, cfg())?;
                Ok(Tensor::host(data, shape))
            }
            (Storage::Device(a), Storage::Device(b)) => {
                a.check_same(op_name(op), b)?;
                let shape = broadcast_shape(op_name(op), &self.shape, &other.shape)?;
                let out = a.zeros(&shape)?;
                out.launch(BINARY, NdRange::d1(shape.elements()), |launch| {
                    Ok(launch
                        .arg_mem(out.data()?)
                        .arg_mem(a.data()?)
                        .arg_mem(a.shape_buf()?)
                        .arg_mem(b.data()?)
                        .arg_mem(b.shape_buf()?)
                        .arg_int(op.code() as i64))
                })?;
                Ok(Tensor::on_device(out, shape))
            }
            (lhs, rhs) => Err(placement_mismatch(op_name(op), lhs, rhs)),
        }
    }

    /// `self = self op other`; `other` must broadcast to `self`'s shape.
    fn binary_assign(&mut self, op: BinaryOp, other: &Tensor) -> Result<()> {
        let target = broadcast_shape(op_name(op), &self.shape, &other.shape)?;
        if target != self.shape {
            return Err(TensorError::ShapeMismatch {
                op: op_name(op),
                lhs: self.shape.clone(),
                rhs: other.shape.clone(),
            });
        }
        if let (Storage::Host(a), Storage::Host(b)) = (&mut self.storage, &other.storage) {
            return broadcast_assign(op, Arc::make_mut(a).as_mut_slice(), &self.shape, b, &other.shape, cfg());
        }
        // Device buffers may be shared with other handles; write a fresh one.
        let out = self.binary(op, other)?;
        self.storage = out.storage;
        Ok(())
    }

    /// Elementwise sum with broadcasting.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(BinaryOp::Add, other)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(BinaryOp::Sub, other)
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(BinaryOp::Mul, other)
    }

    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(BinaryOp::Div, other)
    }

    /// In-place `self += other`. Not recorded in the graph.
    pub fn add_assign(&mut self, other: &Tensor) -> Result<()> {
        self.binary_assign(BinaryOp::Add, other)
    }

    pub fn sub_assign(&mut self, other: &Tensor) -> Result<()> {
        self.binary_assign(BinaryOp::Sub, other)
    }

    pub fn mul_assign(&mut self, other: &Tensor) -> Result<()> {
        self.binary_assign(BinaryOp::Mul, other)
    }

    pub fn div_assign(&mut self, other: &Tensor) -> Result<()> {
        self.binary_assign(BinaryOp::Div, other)
    }

    pub fn add_with_grad(&self, other: &Tensor) -> Result<Tensor> {
        apply(ArithmeticOp(BinaryOp::Add), &[self, other])
    }

    pub fn sub_with_grad(&self, other: &Tensor) -> Result<Tensor> {
        apply(ArithmeticOp(BinaryOp::Sub), &[self, other])
    }

    pub fn mul_with_grad(&self, other: &Tensor) -> Result<Tensor> {
        apply(ArithmeticOp(BinaryOp::Mul), &[self, other])
    }

    pub fn div_with_grad(&self, other: &Tensor) -> Result<Tensor> {
        apply(ArithmeticOp(BinaryOp::Div), &[self, other])
    }
}

/// Broadcasting binary arithmetic. Gradients are summed back down to each
/// input's shape.
#[derive(Debug, Clone, Copy)]
pub struct ArithmeticOp(pub BinaryOp);

impl Operation for ArithmeticOp {
    fn name(&self) -> &'static str {
        op_name(self.0)
    }

    fn compute(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        inputs[0].binary(self.0, inputs[1])
    }

    fn backward(&self, grad: &Tensor, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let (a, b) = (&inputs[0], &inputs[1]);
        let (da, db) = match self.0 {
            BinaryOp::Add => (grad.clone(), grad.clone()),
            BinaryOp::Sub => (grad.clone(), grad.scale(-1.0)?),
            BinaryOp::Mul => (grad.mul(b)?, grad.mul(a)?),
            BinaryOp::Div => {
                // d(a/b)/db = -a / b^2
                let db = grad.mul(a)?.div(&b.mul(b)?)?.scale(-1.0)?;
                (grad.div(b)?, db)
            }
        };
        Ok(vec![da.sum_to(a.shape())?, db.sum_to(b.shape())?])
    }
}
