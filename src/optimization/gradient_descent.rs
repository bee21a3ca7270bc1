use super::UpdateRule;
use crate::{Result, error::check_len};

#[derive(Debug)]
pub struct GradientDescent {
    learning_rate: f32,
}

impl GradientDescent {
    /// Creates a new `GradientDescent` update rule.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl UpdateRule for GradientDescent {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_len("gradient descent", "gradient", grad.len(), params.len())?;
        let lr = self.learning_rate;

        for (p, g) in params.iter_mut().zip(grad) {
            *p -= lr * g;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_against_the_gradient() {
        let mut params = [1., 2.];
        GradientDescent::new(0.5)
            .update_params(&[2., -4.], &mut params)
            .unwrap();

        assert_eq!(params, [0., 4.]);
    }
}
