use std::{fmt, fs, path::Path};

use log::debug;
use serde::{Deserialize, Serialize};

use super::{
    CharsEncoder, CharsModel, CharsOptimizer, EmbeddingsEncoder, EmbeddingsModel,
    EmbeddingsOptimizer, Encoder, EncoderOptimizer, EncoderOptions, EnsembleEncoder, EnsembleModel,
    EnsembleOptimizer, MorphoEncoder, MorphoModel, ReductionEncoder, ReductionModel,
    ReductionOptimizer, TransformerEncoder, TransformerModel, TransformerOptimizer,
};
use crate::{
    Result,
    arch::layers::{AttentionParams, BiRnnParams},
    optimization::{BlockOptimizer, UpdateMethod},
};

/// The closed set of encoder kinds.
///
/// A model is plain configuration data: it holds the parameters but none of the transient
/// state of a forward/backward cycle, which lives in the `Encoder` built from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncoderModel {
    Embeddings(EmbeddingsModel),
    CharsBiRnn(CharsModel<BiRnnParams>),
    CharsAttention(CharsModel<AttentionParams>),
    Transformer(TransformerModel),
    Morpho(MorphoModel),
    Reduction(ReductionModel),
    Ensemble(EnsembleModel),
}

impl EncoderModel {
    pub fn kind(&self) -> &'static str {
        match self {
            EncoderModel::Embeddings(_) => "embeddings",
            EncoderModel::CharsBiRnn(_) => "chars birnn",
            EncoderModel::CharsAttention(_) => "chars attention",
            EncoderModel::Transformer(_) => "transformer",
            EncoderModel::Morpho(_) => "morpho",
            EncoderModel::Reduction(_) => "reduction",
            EncoderModel::Ensemble(_) => "ensemble",
        }
    }

    /// The width of every vector the encoders of this model output.
    pub fn encoding_size(&self) -> usize {
        match self {
            EncoderModel::Embeddings(m) => m.encoding_size(),
            EncoderModel::CharsBiRnn(m) => m.encoding_size(),
            EncoderModel::CharsAttention(m) => m.encoding_size(),
            EncoderModel::Transformer(m) => m.encoding_size(),
            EncoderModel::Morpho(m) => m.encoding_size(),
            EncoderModel::Reduction(m) => m.encoding_size(),
            EncoderModel::Ensemble(m) => m.encoding_size(),
        }
    }

    /// Checks the structural invariants of the whole model tree.
    pub fn validate(&self) -> Result<()> {
        match self {
            EncoderModel::Embeddings(m) => m.validate(),
            EncoderModel::CharsBiRnn(m) => m.validate(),
            EncoderModel::CharsAttention(m) => m.validate(),
            EncoderModel::Transformer(m) => m.validate(),
            EncoderModel::Morpho(m) => m.validate(),
            EncoderModel::Reduction(m) => m.validate(),
            EncoderModel::Ensemble(m) => m.validate(),
        }
    }

    /// Builds a new encoder of this model.
    ///
    /// # Arguments
    /// * `id` - The identifier of the encoder, usually its pool slot.
    /// * `options` - The options the encoder is built with.
    ///
    /// # Returns
    /// The encoder, or a configuration error if the model is invalid.
    pub fn build_encoder(&self, id: usize, options: EncoderOptions) -> Result<Encoder> {
        self.validate()?;
        debug!(id = id, kind = self.kind(); "building encoder");

        let encoder = match self {
            EncoderModel::Embeddings(_) => Encoder::Embeddings(EmbeddingsEncoder::new(id, options)),
            EncoderModel::CharsBiRnn(_) => Encoder::CharsBiRnn(CharsEncoder::new(id, options)),
            EncoderModel::CharsAttention(_) => {
                Encoder::CharsAttention(CharsEncoder::new(id, options))
            }
            EncoderModel::Transformer(_) => {
                Encoder::Transformer(TransformerEncoder::new(id, options))
            }
            EncoderModel::Morpho(_) => Encoder::Morpho(MorphoEncoder::new(id, options)),
            EncoderModel::Reduction(m) => {
                Encoder::Reduction(ReductionEncoder::new(id, m, options)?)
            }
            EncoderModel::Ensemble(m) => Encoder::Ensemble(EnsembleEncoder::new(id, m, options)?),
        };

        Ok(encoder)
    }

    /// Builds the optimizer of this model.
    ///
    /// # Arguments
    /// * `method` - The update rule applied to every parameter block.
    ///
    /// # Returns
    /// The optimizer, or a configuration error if the model is invalid.
    pub fn build_optimizer(&self, method: &UpdateMethod) -> Result<EncoderOptimizer> {
        self.validate()?;
        debug!(kind = self.kind(); "building optimizer");

        let optimizer = match self {
            EncoderModel::Embeddings(m) => {
                EncoderOptimizer::Embeddings(EmbeddingsOptimizer::new(m, method))
            }
            EncoderModel::CharsBiRnn(m) => {
                EncoderOptimizer::CharsBiRnn(CharsOptimizer::new(m, method))
            }
            EncoderModel::CharsAttention(m) => {
                EncoderOptimizer::CharsAttention(CharsOptimizer::new(m, method))
            }
            EncoderModel::Transformer(m) => {
                EncoderOptimizer::Transformer(TransformerOptimizer::new(m, method))
            }
            EncoderModel::Morpho(m) => {
                EncoderOptimizer::Morpho(BlockOptimizer::new(method, m.dense().size()))
            }
            EncoderModel::Reduction(m) => {
                EncoderOptimizer::Reduction(ReductionOptimizer::new(m, method)?)
            }
            EncoderModel::Ensemble(m) => {
                EncoderOptimizer::Ensemble(EnsembleOptimizer::new(m, method)?)
            }
        };

        Ok(optimizer)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses and validates a model.
    pub fn from_json(json: &str) -> Result<Self> {
        let model: Self = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer(file, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = fs::File::open(path)?;
        let model: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        model.validate()?;
        Ok(model)
    }
}

impl fmt::Display for EncoderModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} encoder, encoding size {}", self.kind(), self.encoding_size())
    }
}

impl From<EmbeddingsModel> for EncoderModel {
    fn from(model: EmbeddingsModel) -> Self {
        EncoderModel::Embeddings(model)
    }
}

impl From<CharsModel<BiRnnParams>> for EncoderModel {
    fn from(model: CharsModel<BiRnnParams>) -> Self {
        EncoderModel::CharsBiRnn(model)
    }
}

impl From<CharsModel<AttentionParams>> for EncoderModel {
    fn from(model: CharsModel<AttentionParams>) -> Self {
        EncoderModel::CharsAttention(model)
    }
}

impl From<TransformerModel> for EncoderModel {
    fn from(model: TransformerModel) -> Self {
        EncoderModel::Transformer(model)
    }
}

impl From<MorphoModel> for EncoderModel {
    fn from(model: MorphoModel) -> Self {
        EncoderModel::Morpho(model)
    }
}

impl From<ReductionModel> for EncoderModel {
    fn from(model: ReductionModel) -> Self {
        EncoderModel::Reduction(model)
    }
}

impl From<EnsembleModel> for EncoderModel {
    fn from(model: EnsembleModel) -> Self {
        EncoderModel::Ensemble(model)
    }
}
