use serde::{Deserialize, Serialize};

use super::Sigmoid;

/// The activation functions a dense layer can apply to its weighted sums.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActFn {
    Sigmoid(Sigmoid),
    Tanh,
    Relu,
}

impl ActFn {
    pub fn sigmoid(amp: f32) -> Self {
        ActFn::Sigmoid(Sigmoid::new(amp))
    }

    pub fn f(&self, z: f32) -> f32 {
        match self {
            ActFn::Sigmoid(a) => a.f(z),
            ActFn::Tanh => z.tanh(),
            ActFn::Relu => z.max(0.),
        }
    }

    /// The derivative of the activation evaluated at the weighted sum `z`.
    pub fn df(&self, z: f32) -> f32 {
        match self {
            ActFn::Sigmoid(a) => a.df(z),
            ActFn::Tanh => 1. - z.tanh().powi(2),
            ActFn::Relu => {
                if z > 0. {
                    1.
                } else {
                    0.
                }
            }
        }
    }
}
