use std::collections::BTreeSet;

use ndarray::Array1;
use serde::{Deserialize, Deserializer, Serialize};

use super::{EncoderOptions, InputErrors};
use crate::{
    EncoderErr, Result,
    arch::{
        Module,
        layers::{Dense, DenseParams},
    },
    pool::Cycle,
    sentence::{Sentence, Token},
};

const KIND: &str = "morpho encoder";

/// The features of a token the extraction collaborator found nothing for.
pub const DEFAULT_FEATURES: [&str; 2] = ["i:0", "p:unknown"];

/// Encodes every token by applying a dense layer to the binary vector of its morphological
/// features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MorphoModel {
    #[serde(deserialize_with = "sorted_features")]
    features: Vec<String>,
    dense: DenseParams,
}

fn sorted_features<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let features = BTreeSet::<String>::deserialize(deserializer)?;
    Ok(features.into_iter().collect())
}

impl MorphoModel {
    /// Creates a new `MorphoModel`.
    ///
    /// # Arguments
    /// * `features` - The features dictionary, duplicates are ignored.
    /// * `dense` - A single input layer as wide as the dictionary.
    pub fn new<I>(features: I, dense: DenseParams) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let features: BTreeSet<_> = features.into_iter().collect();
        let model = Self {
            features: features.into_iter().collect(),
            dense,
        };

        model.validate()?;
        Ok(model)
    }

    /// Collects the features dictionary of a corpus, featureless tokens contributing the
    /// default ones.
    pub fn collect_features(corpus: &[Sentence]) -> BTreeSet<String> {
        corpus
            .iter()
            .flat_map(Sentence::tokens)
            .flat_map(token_features)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.features.is_empty() {
            return Err(EncoderErr::EmptyVocabulary { kind: KIND });
        }

        self.dense.validate()?;
        if self.dense.inputs() != [self.features.len()] {
            return Err(EncoderErr::WidthMismatch {
                kind: KIND,
                what: "dense layer input",
                got: self.dense.input_size(),
                expected: self.features.len(),
            });
        }

        Ok(())
    }

    pub fn encoding_size(&self) -> usize {
        self.dense.output()
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn dense(&self) -> &DenseParams {
        &self.dense
    }

    pub(super) fn dense_mut(&mut self) -> &mut DenseParams {
        &mut self.dense
    }

    /// The binary vector of the known features of `token`.
    fn binarize(&self, token: &Token) -> Array1<f32> {
        let mut x = Array1::zeros(self.features.len());

        for feature in token_features(token) {
            if let Ok(i) = self.features.binary_search(&feature) {
                x[i] = 1.;
            }
        }

        x
    }
}

fn token_features(token: &Token) -> Vec<String> {
    if token.features().is_empty() {
        DEFAULT_FEATURES.map(String::from).to_vec()
    } else {
        token.features().iter().cloned().collect()
    }
}

#[derive(Debug)]
pub struct MorphoEncoder {
    id: usize,
    cycle: Cycle,
    dense: Dense,
}

impl MorphoEncoder {
    pub fn new(id: usize, options: EncoderOptions) -> Self {
        Self {
            id,
            cycle: Cycle::new(),
            dense: Dense::new(id, options.propagate_to_input),
        }
    }

    pub fn forward(&mut self, model: &MorphoModel, sentence: &Sentence) -> Result<Vec<Array1<f32>>> {
        let xs: Vec<_> = sentence
            .tokens()
            .iter()
            .map(|token| model.binarize(token))
            .collect();

        let output = self.dense.forward_single(&model.dense, &xs)?;
        self.cycle.forwarded();
        Ok(output)
    }

    pub fn backward(&mut self, model: &MorphoModel, errors: &[Array1<f32>]) -> Result<()> {
        self.cycle.check_forwarded(KIND, self.id)?;
        self.dense.backward(&model.dense, errors)?;
        self.cycle.backwarded();
        Ok(())
    }

    pub fn params_errors(&mut self, copy: bool) -> Result<Vec<f32>> {
        self.cycle.check_backwarded(KIND, "params errors")?;
        self.dense.params_errors(copy)
    }

    /// The errors of the binary features vector of every token.
    pub fn input_errors(&mut self, copy: bool) -> Result<InputErrors> {
        if !self.dense.propagate_to_input() {
            return Err(EncoderErr::InputErrorsDisabled {
                kind: KIND,
                id: self.id,
            });
        }

        self.cycle.check_backwarded(KIND, "input errors")?;
        self.dense.single_input_errors(copy).map(InputErrors::Tokens)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn propagate_to_input(&self) -> bool {
        self.dense.propagate_to_input()
    }

    pub(super) fn cycle_mut(&mut self) -> &mut Cycle {
        &mut self.cycle
    }
}
