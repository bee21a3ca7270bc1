use log::trace;

use super::{
    CharsOptimizer, EmbeddingsOptimizer, EncoderModel, EnsembleOptimizer, ParamsErrors,
    ReductionOptimizer, TransformerOptimizer,
};
use crate::{EncoderErr, Result, optimization::BlockOptimizer};

/// The optimizer of an `EncoderModel`, mirroring its structure.
///
/// Contributions of many encoders are summed by `accumulate`; `update` applies a single step of
/// the update rule to every parameter block and clears what was accumulated.
#[derive(Debug)]
pub enum EncoderOptimizer {
    Embeddings(EmbeddingsOptimizer),
    CharsBiRnn(CharsOptimizer),
    CharsAttention(CharsOptimizer),
    /// `None` unless the transformer is fine-tuned.
    Transformer(Option<TransformerOptimizer>),
    Morpho(BlockOptimizer),
    Reduction(ReductionOptimizer),
    Ensemble(EnsembleOptimizer),
}

impl EncoderOptimizer {
    pub fn kind(&self) -> &'static str {
        match self {
            EncoderOptimizer::Embeddings(_) => "embeddings",
            EncoderOptimizer::CharsBiRnn(_) => "chars birnn",
            EncoderOptimizer::CharsAttention(_) => "chars attention",
            EncoderOptimizer::Transformer(_) => "transformer",
            EncoderOptimizer::Morpho(_) => "morpho",
            EncoderOptimizer::Reduction(_) => "reduction",
            EncoderOptimizer::Ensemble(_) => "ensemble",
        }
    }

    /// Sums the parameters errors of one encoder into the accumulated ones.
    pub fn accumulate(&mut self, errors: &ParamsErrors) -> Result<()> {
        match (self, errors) {
            (EncoderOptimizer::Embeddings(o), ParamsErrors::Embeddings(e)) => o.accumulate(e),
            (EncoderOptimizer::CharsBiRnn(o), ParamsErrors::CharsBiRnn(e)) => o.accumulate(e),
            (EncoderOptimizer::CharsAttention(o), ParamsErrors::CharsAttention(e)) => {
                o.accumulate(e)
            }
            (EncoderOptimizer::Transformer(o), ParamsErrors::Transformer(e)) => match o {
                Some(o) => o.accumulate(e),
                None => Ok(()),
            },
            (EncoderOptimizer::Morpho(o), ParamsErrors::Morpho(e)) => o.accumulate(e),
            (EncoderOptimizer::Reduction(o), ParamsErrors::Reduction(e)) => o.accumulate(e),
            (EncoderOptimizer::Ensemble(o), ParamsErrors::Ensemble(e)) => o.accumulate(e),
            (optimizer, errors) => Err(EncoderErr::ModelMismatch {
                expected: optimizer.kind(),
                got: errors.kind(),
            }),
        }
    }

    /// Applies the accumulated errors to the parameters of `model`.
    pub fn update(&mut self, model: &mut EncoderModel) -> Result<()> {
        trace!(kind = self.kind(); "updating encoder parameters");

        match (self, model) {
            (EncoderOptimizer::Embeddings(o), EncoderModel::Embeddings(m)) => o.update(m),
            (EncoderOptimizer::CharsBiRnn(o), EncoderModel::CharsBiRnn(m)) => o.update(m),
            (EncoderOptimizer::CharsAttention(o), EncoderModel::CharsAttention(m)) => o.update(m),
            (EncoderOptimizer::Transformer(o), EncoderModel::Transformer(m)) => match o {
                Some(o) => o.update(m),
                None => Ok(()),
            },
            (EncoderOptimizer::Morpho(o), EncoderModel::Morpho(m)) => {
                o.update(m.dense_mut().values_mut())
            }
            (EncoderOptimizer::Reduction(o), EncoderModel::Reduction(m)) => o.update(m),
            (EncoderOptimizer::Ensemble(o), EncoderModel::Ensemble(m)) => o.update(m),
            (optimizer, model) => Err(EncoderErr::ModelMismatch {
                expected: optimizer.kind(),
                got: model.kind(),
            }),
        }
    }
}
