use ndarray::Array1;

use super::{
    CharsEncoder, EmbeddingsEncoder, EncoderModel, EnsembleEncoder, InputErrors, MorphoEncoder,
    ParamsErrors, ReductionEncoder, TransformerEncoder,
};
use crate::{
    EncoderErr, Result,
    arch::{
        Module,
        layers::{Attention, BiRnn},
    },
    pool::{Cycle, Recycle},
    sentence::Sentence,
};

/// A stateful encoder, bound to the model kind it was built from.
///
/// Every call takes the model explicitly; a model of another kind is rejected.
#[derive(Debug)]
pub enum Encoder {
    Embeddings(EmbeddingsEncoder),
    CharsBiRnn(CharsEncoder<BiRnn>),
    CharsAttention(CharsEncoder<Attention>),
    Transformer(TransformerEncoder),
    Morpho(MorphoEncoder),
    Reduction(ReductionEncoder),
    Ensemble(EnsembleEncoder),
}

impl Encoder {
    pub fn kind(&self) -> &'static str {
        match self {
            Encoder::Embeddings(_) => "embeddings",
            Encoder::CharsBiRnn(_) => "chars birnn",
            Encoder::CharsAttention(_) => "chars attention",
            Encoder::Transformer(_) => "transformer",
            Encoder::Morpho(_) => "morpho",
            Encoder::Reduction(_) => "reduction",
            Encoder::Ensemble(_) => "ensemble",
        }
    }

    /// The id the encoder was built with, its slot when pooled.
    pub fn id(&self) -> usize {
        match self {
            Encoder::Embeddings(e) => e.id(),
            Encoder::CharsBiRnn(e) => e.id(),
            Encoder::CharsAttention(e) => e.id(),
            Encoder::Transformer(e) => e.id(),
            Encoder::Morpho(e) => e.id(),
            Encoder::Reduction(e) => e.id(),
            Encoder::Ensemble(e) => e.id(),
        }
    }

    fn mismatch(&self, model: &EncoderModel) -> EncoderErr {
        EncoderErr::ModelMismatch {
            expected: self.kind(),
            got: model.kind(),
        }
    }
}

impl Recycle for Encoder {
    fn cycle_mut(&mut self) -> &mut Cycle {
        match self {
            Encoder::Embeddings(e) => e.cycle_mut(),
            Encoder::CharsBiRnn(e) => e.cycle_mut(),
            Encoder::CharsAttention(e) => e.cycle_mut(),
            Encoder::Transformer(e) => e.cycle_mut(),
            Encoder::Morpho(e) => e.cycle_mut(),
            Encoder::Reduction(e) => e.cycle_mut(),
            Encoder::Ensemble(e) => e.cycle_mut(),
        }
    }
}

impl Module for Encoder {
    type Params = EncoderModel;
    type Input = Sentence;
    type InputErrors = InputErrors;
    type ParamsErrors = ParamsErrors;

    fn forward(&mut self, model: &EncoderModel, sentence: &Sentence) -> Result<Vec<Array1<f32>>> {
        match (self, model) {
            (Encoder::Embeddings(e), EncoderModel::Embeddings(m)) => e.forward(m, sentence),
            (Encoder::CharsBiRnn(e), EncoderModel::CharsBiRnn(m)) => e.forward(m, sentence),
            (Encoder::CharsAttention(e), EncoderModel::CharsAttention(m)) => e.forward(m, sentence),
            (Encoder::Transformer(e), EncoderModel::Transformer(m)) => e.forward(m, sentence),
            (Encoder::Morpho(e), EncoderModel::Morpho(m)) => e.forward(m, sentence),
            (Encoder::Reduction(e), EncoderModel::Reduction(m)) => e.forward(m, sentence),
            (Encoder::Ensemble(e), EncoderModel::Ensemble(m)) => e.forward(m, sentence),
            (encoder, model) => Err(encoder.mismatch(model)),
        }
    }

    fn backward(&mut self, model: &EncoderModel, errors: &[Array1<f32>]) -> Result<()> {
        match (self, model) {
            (Encoder::Embeddings(e), EncoderModel::Embeddings(m)) => e.backward(m, errors),
            (Encoder::CharsBiRnn(e), EncoderModel::CharsBiRnn(m)) => e.backward(m, errors),
            (Encoder::CharsAttention(e), EncoderModel::CharsAttention(m)) => e.backward(m, errors),
            (Encoder::Transformer(e), EncoderModel::Transformer(m)) => e.backward(m, errors),
            (Encoder::Morpho(e), EncoderModel::Morpho(m)) => e.backward(m, errors),
            (Encoder::Reduction(e), EncoderModel::Reduction(m)) => e.backward(m, errors),
            (Encoder::Ensemble(e), EncoderModel::Ensemble(m)) => e.backward(m, errors),
            (encoder, model) => Err(encoder.mismatch(model)),
        }
    }

    fn params_errors(&mut self, copy: bool) -> Result<ParamsErrors> {
        let errors = match self {
            Encoder::Embeddings(e) => ParamsErrors::Embeddings(e.params_errors(copy)?),
            Encoder::CharsBiRnn(e) => ParamsErrors::CharsBiRnn(e.params_errors(copy)?),
            Encoder::CharsAttention(e) => ParamsErrors::CharsAttention(e.params_errors(copy)?),
            Encoder::Transformer(e) => ParamsErrors::Transformer(e.params_errors(copy)?),
            Encoder::Morpho(e) => ParamsErrors::Morpho(e.params_errors(copy)?),
            Encoder::Reduction(e) => ParamsErrors::Reduction(e.params_errors(copy)?),
            Encoder::Ensemble(e) => ParamsErrors::Ensemble(e.params_errors(copy)?),
        };

        Ok(errors)
    }

    fn input_errors(&mut self, copy: bool) -> Result<InputErrors> {
        match self {
            Encoder::Embeddings(e) => e.input_errors(copy),
            Encoder::CharsBiRnn(e) => e.input_errors(copy),
            Encoder::CharsAttention(e) => e.input_errors(copy),
            Encoder::Transformer(e) => e.input_errors(copy),
            Encoder::Morpho(e) => e.input_errors(copy),
            Encoder::Reduction(e) => e.input_errors(copy),
            Encoder::Ensemble(e) => e.input_errors(copy),
        }
    }

    fn propagate_to_input(&self) -> bool {
        match self {
            Encoder::Embeddings(e) => e.propagate_to_input(),
            Encoder::CharsBiRnn(e) => e.propagate_to_input(),
            Encoder::CharsAttention(e) => e.propagate_to_input(),
            Encoder::Transformer(e) => e.propagate_to_input(),
            Encoder::Morpho(e) => e.propagate_to_input(),
            Encoder::Reduction(e) => e.propagate_to_input(),
            Encoder::Ensemble(e) => e.propagate_to_input(),
        }
    }
}
