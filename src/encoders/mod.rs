mod chars;
mod embeddings;
mod encoder;
mod ensemble;
mod merge;
mod model;
mod morpho;
mod optimizer;
mod params_errors;
mod pool;
mod reduction;
mod transformer;

use ndarray::Array1;
use rand::{SeedableRng, rngs::StdRng};

pub use chars::{CharsEncoder, CharsModel, CharsOptimizer};
pub use embeddings::{EmbeddingsEncoder, EmbeddingsModel, EmbeddingsOptimizer};
pub use encoder::Encoder;
pub use ensemble::{Component, EnsembleEncoder, EnsembleModel, EnsembleOptimizer};
pub use merge::MergeModel;
pub use model::EncoderModel;
pub use morpho::{DEFAULT_FEATURES, MorphoEncoder, MorphoModel};
pub use optimizer::EncoderOptimizer;
pub use params_errors::{
    CharsParamsErrors, EnsembleParamsErrors, ParamsErrors, ReductionParamsErrors, RowsErrors,
    TransformerParamsErrors,
};
pub use pool::EncodersPool;
pub use reduction::{ReductionEncoder, ReductionModel, ReductionOptimizer};
pub use transformer::{TransformerEncoder, TransformerModel, TransformerOptimizer};

/// The options an encoder is built with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderOptions {
    /// Whether to apply the training time dropout of the encoder kind.
    pub use_dropout: bool,
    /// Whether `backward` computes the errors with respect to the input.
    pub propagate_to_input: bool,
    /// The seed of the dropout random number generator, taken from the OS if not given.
    pub seed: Option<u64>,
}

impl EncoderOptions {
    /// The options of an encoder used for training, with dropout enabled.
    pub fn training() -> Self {
        Self {
            use_dropout: true,
            ..Self::default()
        }
    }

    pub fn with_propagate_to_input(mut self, propagate_to_input: bool) -> Self {
        self.propagate_to_input = propagate_to_input;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// The options of the branch at `index` of a composite encoder, with its own seed.
    fn for_branch(mut self, index: usize) -> Self {
        self.seed = self
            .seed
            .map(|seed| (seed ^ (index as u64 + 1)).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        self
    }

    fn generate_rng(&self, id: usize) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id as u64)),
            None => StdRng::from_os_rng(),
        }
    }
}

/// The errors of an encoder with respect to its input.
#[derive(Debug, Clone, PartialEq)]
pub enum InputErrors {
    /// One vector per token, the errors of the vector the token was encoded from.
    Tokens(Vec<Array1<f32>>),
    /// The input of the encoder isn't made of vectors, e.g. the characters of the tokens.
    NoInputErrors,
}

impl InputErrors {
    /// The per token errors, if any.
    pub fn tokens(&self) -> Option<&[Array1<f32>]> {
        match self {
            InputErrors::Tokens(errors) => Some(errors),
            InputErrors::NoInputErrors => None,
        }
    }
}
