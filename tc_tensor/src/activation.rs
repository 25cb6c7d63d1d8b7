//! Elementwise activation functions.

/// An activation and its derivative, both taken at the pre-activation input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    ReLU,
    /// Slope for negative inputs.
    LeakyReLU(f32),
    Sigmoid,
    Tanh,
    Identity,
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl Activation {
    pub fn activate(&self, x: f32) -> f32 {
        match *self {
            Activation::ReLU => x.max(0.0),
            Activation::LeakyReLU(alpha) => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            Activation::Sigmoid => sigmoid(x),
            Activation::Tanh => x.tanh(),
            Activation::Identity => x,
        }
    }

    pub fn derivative(&self, x: f32) -> f32 {
        match *self {
            Activation::ReLU => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyReLU(alpha) => {
                if x > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            Activation::Sigmoid => {
                let s = sigmoid(x);
                s * (1.0 - s)
            }
            Activation::Tanh => {
                let t = x.tanh();
                1.0 - t * t
            }
            Activation::Identity => 1.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Activation::ReLU => "relu",
            Activation::LeakyReLU(_) => "leaky_relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::Identity => "identity",
        }
    }

    /// Kernel argument encoding: a kind code and a float parameter.
    pub(crate) fn encode(&self) -> (i64, f32) {
        match *self {
            Activation::ReLU => (0, 0.0),
            Activation::LeakyReLU(alpha) => (1, alpha),
            Activation::Sigmoid => (2, 0.0),
            Activation::Tanh => (3, 0.0),
            Activation::Identity => (4, 0.0),
        }
    }

    pub(crate) fn decode(code: i64, param: f32) -> Option<Self> {
        Some(match code {
            0 => Activation::ReLU,
            1 => Activation::LeakyReLU(param),
            2 => Activation::Sigmoid,
            3 => Activation::Tanh,
            4 => Activation::Identity,
            _ => return None,
        })
    }
}
