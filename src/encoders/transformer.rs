use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::{EncoderOptions, InputErrors, TransformerParamsErrors};
use crate::{
    EncoderErr, Result,
    arch::{
        EmbeddingsMap, KeyExtractor, Module,
        layers::{SelfAttention, SelfAttentionParams},
        module,
    },
    optimization::{BlockOptimizer, GradientAccumulator, Reduction, RowsOptimizer, UpdateMethod},
    pool::Cycle,
    sentence::Sentence,
};

const KIND: &str = "transformer encoder";

/// Encodes the tokens with a pretrained self-attention block over their embeddings.
///
/// Unless `fine_tuning` is set the model is frozen and gets no optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerModel {
    embeddings: EmbeddingsMap<String>,
    extractor: KeyExtractor,
    layer: SelfAttentionParams,
    #[serde(default)]
    fine_tuning: bool,
}

impl TransformerModel {
    pub fn new(
        embeddings: EmbeddingsMap<String>,
        extractor: KeyExtractor,
        layer: SelfAttentionParams,
        fine_tuning: bool,
    ) -> Result<Self> {
        let model = Self {
            embeddings,
            extractor,
            layer,
            fine_tuning,
        };

        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> Result<()> {
        self.embeddings.validate()?;
        self.layer.validate()?;

        if self.embeddings.width() != self.layer.width() {
            return Err(EncoderErr::WidthMismatch {
                kind: KIND,
                what: "embeddings",
                got: self.embeddings.width(),
                expected: self.layer.width(),
            });
        }

        Ok(())
    }

    pub fn encoding_size(&self) -> usize {
        self.layer.width()
    }

    pub fn fine_tuning(&self) -> bool {
        self.fine_tuning
    }

    pub fn embeddings(&self) -> &EmbeddingsMap<String> {
        &self.embeddings
    }

    pub fn layer(&self) -> &SelfAttentionParams {
        &self.layer
    }
}

#[derive(Debug)]
pub struct TransformerEncoder {
    id: usize,
    options: EncoderOptions,
    cycle: Cycle,
    attention: SelfAttention,

    // Forward metadata
    rows: Vec<usize>,

    // Backward metadata
    accumulator: GradientAccumulator<usize>,
    grad: Option<TransformerParamsErrors>,
    input_errors: Option<Vec<Array1<f32>>>,
}

impl TransformerEncoder {
    pub fn new(id: usize, options: EncoderOptions) -> Self {
        Self {
            id,
            options,
            cycle: Cycle::new(),
            attention: SelfAttention::new(id, true),
            rows: Vec::new(),
            accumulator: GradientAccumulator::new(),
            grad: None,
            input_errors: None,
        }
    }

    pub fn forward(
        &mut self,
        model: &TransformerModel,
        sentence: &Sentence,
    ) -> Result<Vec<Array1<f32>>> {
        self.grad = None;
        self.input_errors = None;
        self.rows = sentence
            .tokens()
            .iter()
            .map(|token| model.embeddings.index(&model.extractor.extract(token)))
            .collect();

        let xs: Vec<_> = self
            .rows
            .iter()
            .map(|&row| model.embeddings.row(row).to_owned())
            .collect();

        let output = self.attention.forward(&model.layer, &xs)?;
        self.cycle.forwarded();
        Ok(output)
    }

    pub fn backward(&mut self, model: &TransformerModel, errors: &[Array1<f32>]) -> Result<()> {
        self.cycle.check_forwarded(KIND, self.id)?;
        module::check_errors(KIND, errors, self.rows.len(), model.encoding_size())?;

        self.attention.backward(&model.layer, errors)?;
        let layer = self.attention.params_errors(false)?;
        let dxs = self.attention.input_errors(false)?;

        self.accumulator.reset();
        for (&row, dx) in self.rows.iter().zip(&dxs) {
            self.accumulator.accumulate(row, &dx.to_vec())?;
        }

        let embeddings = self.accumulator.params_errors(Reduction::Mean, false)?;
        self.grad = Some(TransformerParamsErrors { layer, embeddings });
        self.input_errors = self.options.propagate_to_input.then_some(dxs);
        self.cycle.backwarded();
        Ok(())
    }

    pub fn params_errors(&mut self, copy: bool) -> Result<TransformerParamsErrors> {
        self.cycle.check_backwarded(KIND, "params errors")?;
        module::retrieve(&mut self.grad, copy, KIND, "params errors")
    }

    /// The errors of the embeddings the self-attention block was fed with.
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

/// Fine-tunes both the self-attention block and the embeddings.
#[derive(Debug)]
pub struct TransformerOptimizer {
    layer: BlockOptimizer,
    embeddings: RowsOptimizer,
}

impl TransformerOptimizer {
    /// Creates a new `TransformerOptimizer`, `None` if the model isn't fine-tuned.
    pub fn new(model: &TransformerModel, method: &UpdateMethod) -> Option<Self> {
        model.fine_tuning.then(|| Self {
            layer: BlockOptimizer::new(method, model.layer.size()),
            embeddings: RowsOptimizer::new(method, model.embeddings.width()),
        })
    }

    pub fn accumulate(&mut self, errors: &TransformerParamsErrors) -> Result<()> {
        self.layer.accumulate(&errors.layer)?;
        self.embeddings.accumulate(&errors.embeddings)
    }

    pub fn update(&mut self, model: &mut TransformerModel) -> Result<()> {
        self.layer.update(model.layer.values_mut())?;
        self.embeddings.update(&mut model.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Initializer;
    use rand::{SeedableRng, rngs::StdRng};

    fn model(fine_tuning: bool) -> TransformerModel {
        let mut rng = StdRng::seed_from_u64(9);
        let init = Initializer::default();
        let keys = ["a", "b", "c"].map(String::from);
        let embeddings = EmbeddingsMap::new(3, keys, &init, &mut rng).unwrap();
        let layer = SelfAttentionParams::new(3, &init, &mut rng).unwrap();
        TransformerModel::new(embeddings, KeyExtractor::Lowercase, layer, fine_tuning).unwrap()
    }

    #[test]
    fn frozen_models_get_no_optimizer() {
        let method = UpdateMethod::GradientDescent { learning_rate: 0.1 };

        assert!(TransformerOptimizer::new(&model(false), &method).is_none());
        assert!(TransformerOptimizer::new(&model(true), &method).is_some());
    }

    #[test]
    fn input_errors_cover_every_token() {
        let model = model(false);
        let options = EncoderOptions::default().with_propagate_to_input(true);
        let mut encoder = TransformerEncoder::new(0, options);
        let sentence = Sentence::from_forms(["A", "b", "zz", "a"]);

        let output = encoder.forward(&model, &sentence).unwrap();
        assert_eq!(output.len(), 4);
        assert!(output.iter().all(|y| y.len() == 3));

        let errors = vec![Array1::ones(3); 4];
        encoder.backward(&model, &errors).unwrap();

        let input_errors = encoder.input_errors(false).unwrap();
        assert_eq!(input_errors.tokens().map(<[_]>::len), Some(4));

        let rows: Vec<_> = encoder
            .params_errors(false)
            .unwrap()
            .embeddings
            .into_iter()
            .map(|(row, _)| row)
            .collect();
        assert_eq!(rows, [1, 2, 0]);
    }

    #[test]
    fn fine_tuning_updates_the_layer() {
        let mut model = model(true);
        let before = model.clone();
        let method = UpdateMethod::GradientDescent { learning_rate: 0.5 };
        let mut optimizer = TransformerOptimizer::new(&model, &method).unwrap();
        let mut encoder = TransformerEncoder::new(0, EncoderOptions::default());

        encoder.forward(&model, &Sentence::from_forms(["a", "b"])).unwrap();
        encoder
            .backward(&model, &[Array1::ones(3), Array1::from(vec![1., -1., 0.])])
            .unwrap();
        optimizer
            .accumulate(&encoder.params_errors(false).unwrap())
            .unwrap();
        optimizer.update(&mut model).unwrap();

        assert_ne!(model.layer(), before.layer());
        assert_ne!(model.embeddings().get(&"a".to_string()), before.embeddings().get(&"a".to_string()));
    }
}
