use ndarray::Array1;
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};

use crate::{EncoderErr, Result};

/// Generates the initial values of a parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initializer {
    Constant { value: f32 },
    Uniform { low: f32, high: f32 },
    /// Xavier/Glorot uniform initialization, bounded by `sqrt(6 / (fan_in + fan_out))`.
    GlorotUniform,
    Normal { mean: f32, std_dev: f32 },
    /// Kaiming normal initialization, `std_dev = sqrt(2 / fan_in)`.
    Kaiming,
}

impl Default for Initializer {
    fn default() -> Self {
        Self::GlorotUniform
    }
}

impl Initializer {
    /// Samples `n` values.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `n` - The amount of values to generate.
    /// * `fan_in` - The number of input units of the block.
    /// * `fan_out` - The number of output units of the block.
    ///
    /// # Returns
    /// The sampled values or an error if the distribution's parameters are invalid.
    pub fn sample<R: Rng>(
        &self,
        rng: &mut R,
        n: usize,
        fan_in: usize,
        fan_out: usize,
    ) -> Result<Array1<f32>> {
        match *self {
            Initializer::Constant { value } => Ok(Array1::from_elem(n, value)),
            Initializer::Uniform { low, high } => {
                let uniform = Uniform::new(low, high)
                    .map_err(|e| EncoderErr::InvalidInitializer(e.to_string()))?;
                Ok(draw(rng, &uniform, n))
            }
            Initializer::GlorotUniform => {
                let range = (6. / (fan_in + fan_out).max(1) as f32).sqrt();
                Initializer::Uniform {
                    low: -range,
                    high: range,
                }
                .sample(rng, n, fan_in, fan_out)
            }
            Initializer::Normal { mean, std_dev } => {
                let normal = Normal::new(mean, std_dev)
                    .map_err(|e| EncoderErr::InvalidInitializer(e.to_string()))?;
                Ok(draw(rng, &normal, n))
            }
            Initializer::Kaiming => {
                let std_dev = (2. / fan_in.max(1) as f32).sqrt();
                Initializer::Normal { mean: 0., std_dev }.sample(rng, n, fan_in, fan_out)
            }
        }
    }
}

fn draw<R: Rng, D: Distribution<f32>>(rng: &mut R, distribution: &D, n: usize) -> Array1<f32> {
    (0..n).map(|_| distribution.sample(rng)).collect()
}
