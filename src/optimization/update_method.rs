use serde::{Deserialize, Serialize};

use super::{Adam, GradientDescent, GradientDescentWithMomentum, UpdateRule};

/// The description of the update rule an optimizer applies to every parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMethod {
    GradientDescent {
        learning_rate: f32,
    },
    GradientDescentWithMomentum {
        learning_rate: f32,
        momentum: f32,
    },
    Adam {
        learning_rate: f32,
        #[serde(default = "default_beta1")]
        beta1: f32,
        #[serde(default = "default_beta2")]
        beta2: f32,
        #[serde(default = "default_epsilon")]
        epsilon: f32,
    },
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_epsilon() -> f32 {
    1e-8
}

impl UpdateMethod {
    /// Builds a fresh update rule for a block of `len` parameters.
    pub fn build(&self, len: usize) -> Box<dyn UpdateRule> {
        match *self {
            UpdateMethod::GradientDescent { learning_rate } => {
                Box::new(GradientDescent::new(learning_rate))
            }
            UpdateMethod::GradientDescentWithMomentum {
                learning_rate,
                momentum,
            } => Box::new(GradientDescentWithMomentum::new(
                len,
                learning_rate,
                momentum,
            )),
            UpdateMethod::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => Box::new(Adam::new(len, learning_rate, beta1, beta2, epsilon)),
        }
    }
}
