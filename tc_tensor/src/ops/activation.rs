//! Pointwise activations and their gradients.

use tc_backend_cpu::{elementwise, BinaryOp};
use tc_backend_device::NdRange;

use super::cfg;
use crate::activation::Activation;
use crate::autograd::{apply, Operation};
use crate::device_kernels::{ACTIVATE, ACTIVATE_GRAD};
use crate::error::{Result, TensorError};
use crate::storage::{placement_mismatch, Storage};
use crate::tensor::Tensor;

impl Tensor {
    /// Apply `act` to every element.
    pub fn activate(&self, act: Activation) -> Result<Tensor> {
        match &self.storage {
            Storage::Host(src) => Ok(Tensor::host(
                elementwise::map(src, |x| act.activate(x), cfg()),
                self.shape.clone(),
            )),
            Storage::Device(src) => {
                let (kind, param) = act.encode();
                let out = src.zeros(&self.shape)?;
                out.launch(ACTIVATE, NdRange::d1(self.elements()), |launch| {
                    Ok(launch
                        .arg_mem(out.data()?)
                        .arg_mem(src.data()?)
                        .arg_int(kind)
                        .arg_float(param))
                })?;
                Ok(Tensor::on_device(out, self.shape.clone()))
            }
        }
    }

    pub fn activate_with_grad(&self, act: Activation) -> Result<Tensor> {
        apply(ActivationOp(act), &[self])
    }
}

/// `grad * act'(input)`, elementwise.
pub(crate) fn activation_grad(grad: &Tensor, input: &Tensor, act: Activation) -> Result<Tensor> {
    if grad.shape() != input.shape() {
        return Err(TensorError::ShapeMismatch {
            op: act.name(),
            lhs: grad.shape().clone(),
            rhs: input.shape().clone(),
        });
    }
    match (&grad.storage, &input.storage) {
        (Storage::Host(g), Storage::Host(x)) => {
            let mut out = elementwise::map(x, |v| act.derivative(v), cfg());
            elementwise::binary_assign(BinaryOp::Mul, &mut out, g, cfg());
            Ok(Tensor::host(out, input.shape().clone()))
        }
        (Storage::Device(g), Storage::Device(x)) => {
            g.check_same(act.name(), x)?;
            let (kind, param) = act.encode();
            let out = x.zeros(input.shape())?;
            out.launch(ACTIVATE_GRAD, NdRange::d1(input.elements()), |launch| {
                Ok(launch
                    .arg_mem(out.data()?)
                    .arg_mem(g.data()?)
                    .arg_mem(x.data()?)
                    .arg_int(kind)
                    .arg_float(param))
            })?;
            Ok(Tensor::on_device(out, input.shape().clone()))
        }
        (lhs, rhs) => Err(placement_mismatch(act.name(), lhs, rhs)),
    }
}

/// Elementwise activation. The derivative is taken at the saved input.
#[derive(Debug, Clone, Copy)]
pub struct ActivationOp(pub Activation);

impl Operation for ActivationOp {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn required_inputs(&self) -> usize {
        1
    }

    fn compute(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        inputs[0].activate(self.0)
    }

    fn backward(&self, grad: &Tensor, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        Ok(vec![activation_grad(grad, &inputs[0], self.0)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_activate_host() {
        let x = Tensor::from_vec(vec![-2.0, 0.0, 3.0], [3]).unwrap();
        assert_eq!(x.activate(Activation::ReLU).unwrap().to_vec().unwrap(), vec![0.0, 0.0, 3.0]);
        assert_eq!(
            x.activate(Activation::LeakyReLU(0.5)).unwrap().to_vec().unwrap(),
            vec![-1.0, 0.0, 3.0]
        );
        let s = x.activate(Activation::Sigmoid).unwrap().to_vec().unwrap();
        assert_relative_eq!(s[1], 0.5);
    }

    #[test]
    fn test_activation_gradients() {
        let x = Tensor::from_vec(vec![-1.0, 2.0], [2]).unwrap().track_grad();
        x.activate_with_grad(Activation::ReLU).unwrap().backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec().unwrap(), vec![0.0, 1.0]);

        let y = Tensor::from_vec(vec![0.0], [1]).unwrap().track_grad();
        y.activate_with_grad(Activation::Tanh).unwrap().backward().unwrap();
        assert_relative_eq!(y.grad().unwrap().to_vec().unwrap()[0], 1.0);
    }

    #[test]
    fn test_activation_grad_shape_checked() {
        let err = activation_grad(&Tensor::ones([2]), &Tensor::ones([3]), Activation::Sigmoid).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { op: "sigmoid", .. }));
    }
}
