use ndarray::Array1;

use crate::{EncoderErr, Result};

/// The contract every differentiable computation satisfies, from a single dense layer up to a
/// whole ensemble of encoders.
///
/// A module owns only transient state. Its parameters live in `Params`, which is read-only
/// during `forward` and `backward` and is mutated exclusively by an optimizer between cycles.
pub trait Module {
    /// The parameters the module reads.
    type Params: ?Sized;

    /// The input of a forward pass, yielding one output vector per element.
    type Input: ?Sized;

    /// The errors with respect to the input.
    type InputErrors;

    /// The errors with respect to the parameters.
    type ParamsErrors;

    /// Computes one output vector per input element, capturing the state the matching
    /// `backward` needs.
    fn forward(&mut self, params: &Self::Params, input: &Self::Input) -> Result<Vec<Array1<f32>>>;

    /// Propagates one error vector per output element of the last `forward`.
    ///
    /// Fails if no forward preceded it or if the errors don't match the last output.
    fn backward(&mut self, params: &Self::Params, output_errors: &[Array1<f32>]) -> Result<()>;

    /// Returns the parameters errors computed by the last `backward`.
    ///
    /// With `copy == false` the internal buffer is handed over and can't be retrieved again
    /// until the next `backward`.
    fn params_errors(&mut self, copy: bool) -> Result<Self::ParamsErrors>;

    /// Returns the input errors computed by the last `backward`.
    ///
    /// Fails if the module was built without `propagate_to_input`.
    fn input_errors(&mut self, copy: bool) -> Result<Self::InputErrors>;

    /// Whether `backward` computes the errors with respect to the input.
    fn propagate_to_input(&self) -> bool;
}

/// Hands over (or copies) errors retained between a backward and their retrieval.
pub(crate) fn retrieve<T: Clone>(
    slot: &mut Option<T>,
    copy: bool,
    kind: &'static str,
    what: &'static str,
) -> Result<T> {
    let errors = if copy { slot.clone() } else { slot.take() };
    errors.ok_or(EncoderErr::ErrorsUnavailable { kind, what })
}

/// Checks that `errors` has one vector of width `width` per output element.
pub(crate) fn check_errors(
    kind: &'static str,
    errors: &[Array1<f32>],
    count: usize,
    width: usize,
) -> Result<()> {
    crate::error::check_len(kind, "output errors count", errors.len(), count)?;

    for e in errors {
        crate::error::check_len(kind, "output errors width", e.len(), width)?;
    }

    Ok(())
}
