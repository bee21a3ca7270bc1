use std::fmt::Debug;

use crate::Result;

/// Defines the strategy for updating a block of parameters based on its accumulated gradient.
pub trait UpdateRule: Debug {
    /// Updates the provided slice of parameters using the accumulated gradient.
    ///
    /// # Arguments
    /// * `grad` - The gradient of the block.
    /// * `params` - The parameters to update.
    ///
    /// # Returns
    /// An error if there's a mismatch in the sizes of `grad` and `params`.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()>;
}
