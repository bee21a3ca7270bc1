/// The errors of the touched rows of an embeddings table, in first touch order.
pub type RowsErrors = Vec<(usize, Vec<f32>)>;

/// The errors of the parameters of an encoder, mirroring the structure of its model.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamsErrors {
    Embeddings(RowsErrors),
    CharsBiRnn(CharsParamsErrors),
    CharsAttention(CharsParamsErrors),
    Transformer(TransformerParamsErrors),
    Morpho(Vec<f32>),
    Reduction(ReductionParamsErrors),
    Ensemble(EnsembleParamsErrors),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CharsParamsErrors {
    /// Summed over every token of the sentence.
    pub network: Vec<f32>,
    pub chars: RowsErrors,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformerParamsErrors {
    pub layer: Vec<f32>,
    pub embeddings: RowsErrors,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReductionParamsErrors {
    /// `None` when the input encoder isn't optimized.
    pub input: Option<Box<ParamsErrors>>,
    pub reduction: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleParamsErrors {
    /// `None` for merges without parameters.
    pub merge: Option<Vec<f32>>,
    /// One entry per component, `None` for the frozen ones.
    pub branches: Vec<Option<ParamsErrors>>,
}

impl ParamsErrors {
    pub fn kind(&self) -> &'static str {
        match self {
            ParamsErrors::Embeddings(_) => "embeddings",
            ParamsErrors::CharsBiRnn(_) => "chars birnn",
            ParamsErrors::CharsAttention(_) => "chars attention",
            ParamsErrors::Transformer(_) => "transformer",
            ParamsErrors::Morpho(_) => "morpho",
            ParamsErrors::Reduction(_) => "reduction",
            ParamsErrors::Ensemble(_) => "ensemble",
        }
    }
}
