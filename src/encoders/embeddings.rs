use std::collections::HashMap;

use ndarray::Array1;
use rand::{Rng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use super::{EncoderOptions, InputErrors, RowsErrors};
use crate::{
    EncoderErr, Result,
    arch::{
        EmbeddingsMap, KeyExtractor, module,
        embeddings::UNKNOWN,
    },
    optimization::{GradientAccumulator, Reduction, RowsOptimizer, UpdateMethod},
    pool::Cycle,
    sentence::{Sentence, Token},
};

const KIND: &str = "embeddings encoder";

/// Encodes every token with the embedding of its key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsModel {
    embeddings: EmbeddingsMap<String>,
    extractor: KeyExtractor,
    #[serde(default)]
    fallbacks: Vec<KeyExtractor>,
    #[serde(default)]
    dropout: f32,
    #[serde(default)]
    frequencies: Option<HashMap<String, usize>>,
}

impl EmbeddingsModel {
    /// Creates a new `EmbeddingsModel` without dropout.
    ///
    /// # Arguments
    /// * `embeddings` - The embeddings table.
    /// * `extractor` - Derives the key of a token.
    pub fn new(embeddings: EmbeddingsMap<String>, extractor: KeyExtractor) -> Self {
        Self {
            embeddings,
            extractor,
            fallbacks: Vec::new(),
            dropout: 0.,
            frequencies: None,
        }
    }

    /// Sets the extractors tried, in order, when the key of the main one is unknown.
    pub fn with_fallbacks(mut self, fallbacks: Vec<KeyExtractor>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// Sets the dropout coefficient.
    ///
    /// # Arguments
    /// * `dropout` - The probability of replacing an embedding with the unknown one, or the
    ///   coefficient `a` of `a / (occurrences + a)` if `frequencies` are given.
    /// * `frequencies` - The occurrences of each key in the training corpus.
    pub fn with_dropout(
        mut self,
        dropout: f32,
        frequencies: Option<HashMap<String, usize>>,
    ) -> Result<Self> {
        self.dropout = dropout;
        self.frequencies = frequencies;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0. ..=1.).contains(&self.dropout) {
            return Err(EncoderErr::InvalidDropout { got: self.dropout });
        }

        self.embeddings.validate()
    }

    pub fn encoding_size(&self) -> usize {
        self.embeddings.width()
    }

    pub fn embeddings(&self) -> &EmbeddingsMap<String> {
        &self.embeddings
    }

    pub fn embeddings_mut(&mut self) -> &mut EmbeddingsMap<String> {
        &mut self.embeddings
    }

    pub fn dropout(&self) -> f32 {
        self.dropout
    }

    /// Finds the row of a token and the key it was found with.
    fn lookup(&self, token: &Token) -> (usize, Option<String>) {
        let keys = std::iter::once(&self.extractor)
            .chain(&self.fallbacks)
            .map(|extractor| extractor.extract(token));

        self.embeddings.first_index(keys)
    }

    /// The probability of dropping the embedding of `key`.
    fn dropout_probability(&self, key: Option<&String>) -> f32 {
        match &self.frequencies {
            Some(frequencies) if self.dropout > 0. => {
                let occurrences = key.and_then(|k| frequencies.get(k)).copied().unwrap_or(0);
                self.dropout / (occurrences as f32 + self.dropout)
            }
            Some(_) => 0.,
            None => self.dropout,
        }
    }
}

/// The transient state of an embeddings lookup over one sentence.
///
/// The errors of a row looked up by several tokens are averaged.
#[derive(Debug)]
pub struct EmbeddingsEncoder {
    id: usize,
    options: EncoderOptions,
    rng: StdRng,
    cycle: Cycle,

    // Forward metadata
    rows: Vec<usize>,

    // Backward metadata
    accumulator: GradientAccumulator<usize>,
    grad: Option<RowsErrors>,
    input_errors: Option<Vec<Array1<f32>>>,
}

impl EmbeddingsEncoder {
    pub fn new(id: usize, options: EncoderOptions) -> Self {
        Self {
            id,
            options,
            rng: options.generate_rng(id),
            cycle: Cycle::new(),
            rows: Vec::new(),
            accumulator: GradientAccumulator::new(),
            grad: None,
            input_errors: None,
        }
    }

    pub fn forward(
        &mut self,
        model: &EmbeddingsModel,
        sentence: &Sentence,
    ) -> Result<Vec<Array1<f32>>> {
        self.grad = None;
        self.input_errors = None;
        self.rows.clear();

        for token in sentence.tokens() {
            let (row, key) = model.lookup(token);
            let dropped = self.options.use_dropout
                && self.rng.random::<f32>() < model.dropout_probability(key.as_ref());

            self.rows.push(if dropped { UNKNOWN } else { row });
        }

        self.cycle.forwarded();
        Ok(self
            .rows
            .iter()
            .map(|&row| model.embeddings.row(row).to_owned())
            .collect())
    }

    pub fn backward(&mut self, model: &EmbeddingsModel, errors: &[Array1<f32>]) -> Result<()> {
        self.cycle.check_forwarded(KIND, self.id)?;
        module::check_errors(KIND, errors, self.rows.len(), model.encoding_size())?;

        self.accumulator.reset();
        for (&row, e) in self.rows.iter().zip(errors) {
            self.accumulator.accumulate(row, &e.to_vec())?;
        }

        self.grad = Some(self.accumulator.params_errors(Reduction::Mean, false)?);
        self.input_errors = self.options.propagate_to_input.then(|| errors.to_vec());
        self.cycle.backwarded();
        Ok(())
    }

    pub fn params_errors(&mut self, copy: bool) -> Result<RowsErrors> {
        self.cycle.check_backwarded(KIND, "params errors")?;
        module::retrieve(&mut self.grad, copy, KIND, "params errors")
    }

    /// The errors of the embeddings the tokens were encoded with.
    pub fn input_errors(&mut self, copy: bool) -> Result<InputErrors> {
        if !self.options.propagate_to_input {
            return Err(EncoderErr::InputErrorsDisabled {
                kind: KIND,
                id: self.id,
            });
        }

        self.cycle.check_backwarded(KIND, "input errors")?;
        module::retrieve(&mut self.input_errors, copy, KIND, "input errors").map(InputErrors::Tokens)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn propagate_to_input(&self) -> bool {
        self.options.propagate_to_input
    }

    pub(super) fn cycle_mut(&mut self) -> &mut Cycle {
        &mut self.cycle
    }
}

/// Updates the rows of the embeddings table touched since the last update.
#[derive(Debug)]
pub struct EmbeddingsOptimizer {
    rows: RowsOptimizer,
}

impl EmbeddingsOptimizer {
    pub fn new(model: &EmbeddingsModel, method: &UpdateMethod) -> Self {
        Self {
            rows: RowsOptimizer::new(method, model.encoding_size()),
        }
    }

    pub fn accumulate(&mut self, errors: &RowsErrors) -> Result<()> {
        self.rows.accumulate(errors)
    }

    pub fn update(&mut self, model: &mut EmbeddingsModel) -> Result<()> {
        self.rows.update(&mut model.embeddings)
    }
}
