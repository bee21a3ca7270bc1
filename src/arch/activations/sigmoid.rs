use serde::{Deserialize, Serialize};

/// A logistic function scaled by `amp`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sigmoid {
    amp: f32,
}

impl Sigmoid {
    pub fn new(amp: f32) -> Self {
        Self { amp }
    }

    pub fn f(&self, z: f32) -> f32 {
        self.amp / (1. + (-z).exp())
    }

    pub fn df(&self, z: f32) -> f32 {
        let e = (-z).exp();
        (self.amp * e) / (e + 1.).powi(2)
    }
}

impl Default for Sigmoid {
    fn default() -> Self {
        Self::new(1.)
    }
}
