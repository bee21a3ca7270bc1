use ndarray::Array1;

use crate::{Result, pool::Recycle};

/// The parameters of a `SequenceReducer`.
pub trait ReducerParams {
    /// The width of every element of the input sequence.
    fn input(&self) -> usize;

    /// The width of the reduced vector.
    fn output(&self) -> usize;

    /// The amount of parameters.
    fn size(&self) -> usize;

    fn validate(&self) -> Result<()>;

    fn values_mut(&mut self) -> &mut [f32];
}

/// A layer reducing a whole sequence of vectors into a single one.
///
/// Unlike a `Module`, a reducer always propagates the errors to its input, since its input is
/// usually made of embeddings that need them.
pub trait SequenceReducer: Recycle + Sized {
    type Params: ReducerParams;

    fn new(id: usize) -> Self;

    /// Reduces `xs`, possibly empty, into one vector of width `params.output()`.
    fn forward(&mut self, params: &Self::Params, xs: &[Array1<f32>]) -> Result<Array1<f32>>;

    /// Propagates the errors of the last reduction.
    fn backward(&mut self, params: &Self::Params, errors: &Array1<f32>) -> Result<()>;

    fn params_errors(&mut self, copy: bool) -> Result<Vec<f32>>;

    /// The errors of each element of the last input sequence.
    fn input_errors(&mut self, copy: bool) -> Result<Vec<Array1<f32>>>;
}
