use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::{CharsParamsErrors, EncoderOptions, InputErrors};
use crate::{
    EncoderErr, Result,
    arch::{
        EmbeddingsMap,
        layers::{ReducerParams, SequenceReducer},
        module,
    },
    optimization::{BlockOptimizer, GradientAccumulator, Reduction, RowsOptimizer, UpdateMethod},
    pool::{Cycle, ItemsPool},
    sentence::Sentence,
};

const KIND: &str = "chars encoder";

/// Encodes every token by reducing the embeddings of its characters with a sequence network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharsModel<P> {
    chars: EmbeddingsMap<char>,
    network: P,
}

impl<P: ReducerParams> CharsModel<P> {
    /// Creates a new `CharsModel`.
    ///
    /// # Arguments
    /// * `chars` - The characters embeddings, as wide as the input of `network`.
    /// * `network` - The reducer of the characters of a token.
    pub fn new(chars: EmbeddingsMap<char>, network: P) -> Result<Self> {
        let model = Self { chars, network };
        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> Result<()> {
        self.chars.validate()?;
        self.network.validate()?;

        if self.chars.width() != self.network.input() {
            return Err(EncoderErr::WidthMismatch {
                kind: KIND,
                what: "characters embeddings",
                got: self.chars.width(),
                expected: self.network.input(),
            });
        }

        Ok(())
    }

    pub fn encoding_size(&self) -> usize {
        self.network.output()
    }

    pub fn chars(&self) -> &EmbeddingsMap<char> {
        &self.chars
    }

    pub fn network(&self) -> &P {
        &self.network
    }
}

/// Runs one pooled reducer per token of the sentence.
///
/// The network errors are summed over the tokens, the errors of a character embedding are
/// averaged over its occurrences in the sentence.
#[derive(Debug)]
pub struct CharsEncoder<R> {
    id: usize,
    options: EncoderOptions,
    cycle: Cycle,
    reducers: ItemsPool<R>,

    // Forward metadata
    token_rows: Vec<Vec<usize>>,

    // Backward metadata
    accumulator: GradientAccumulator<usize>,
    grad: Option<CharsParamsErrors>,
}

impl<R: SequenceReducer> CharsEncoder<R> {
    pub fn new(id: usize, options: EncoderOptions) -> Self {
        Self {
            id,
            options,
            cycle: Cycle::new(),
            reducers: ItemsPool::new(),
            token_rows: Vec::new(),
            accumulator: GradientAccumulator::new(),
            grad: None,
        }
    }

    pub fn forward(
        &mut self,
        model: &CharsModel<R::Params>,
        sentence: &Sentence,
    ) -> Result<Vec<Array1<f32>>> {
        self.grad = None;
        self.token_rows.clear();

        let reducers = self
            .reducers
            .get_items(sentence.len(), |id| Ok(R::new(id)))?;
        let mut output = Vec::with_capacity(sentence.len());

        for (reducer, token) in reducers.iter_mut().zip(sentence.tokens()) {
            let rows: Vec<_> = token.form().chars().map(|c| model.chars.index(&c)).collect();
            let xs: Vec<_> = rows
                .iter()
                .map(|&row| model.chars.row(row).to_owned())
                .collect();

            output.push(reducer.forward(&model.network, &xs)?);
            self.token_rows.push(rows);
        }

        self.cycle.forwarded();
        Ok(output)
    }

    pub fn backward(
        &mut self,
        model: &CharsModel<R::Params>,
        errors: &[Array1<f32>],
    ) -> Result<()> {
        self.cycle.check_forwarded(KIND, self.id)?;
        module::check_errors(KIND, errors, self.token_rows.len(), model.encoding_size())?;

        let mut network = vec![0.; model.network.size()];
        self.accumulator.reset();

        let reducers = self.reducers.issued_mut();
        for ((reducer, rows), e) in reducers.iter_mut().zip(&self.token_rows).zip(errors) {
            reducer.backward(&model.network, e)?;

            let grad = reducer.params_errors(false)?;
            network.iter_mut().zip(&grad).for_each(|(n, g)| *n += g);

            for (&row, dx) in rows.iter().zip(reducer.input_errors(false)?) {
                self.accumulator.accumulate(row, &dx.to_vec())?;
            }
        }

        let chars = self.accumulator.params_errors(Reduction::Mean, false)?;
        self.grad = Some(CharsParamsErrors { network, chars });
        self.cycle.backwarded();
        Ok(())
    }

    pub fn params_errors(&mut self, copy: bool) -> Result<CharsParamsErrors> {
        self.cycle.check_backwarded(KIND, "params errors")?;
        module::retrieve(&mut self.grad, copy, KIND, "params errors")
    }

    /// The input of the encoder are characters, so there are no errors to give back.
    pub fn input_errors(&mut self, _copy: bool) -> Result<InputErrors> {
        if !self.options.propagate_to_input {
            return Err(EncoderErr::InputErrorsDisabled {
                kind: KIND,
                id: self.id,
            });
        }

        self.cycle.check_backwarded(KIND, "input errors")?;
        Ok(InputErrors::NoInputErrors)
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

#[derive(Debug)]
pub struct CharsOptimizer {
    network: BlockOptimizer,
    chars: RowsOptimizer,
}

impl CharsOptimizer {
    pub fn new<P: ReducerParams>(model: &CharsModel<P>, method: &UpdateMethod) -> Self {
        Self {
            network: BlockOptimizer::new(method, model.network.size()),
            chars: RowsOptimizer::new(method, model.chars.width()),
        }
    }

    pub fn accumulate(&mut self, errors: &CharsParamsErrors) -> Result<()> {
        self.network.accumulate(&errors.network)?;
        self.chars.accumulate(&errors.chars)
    }

    pub fn update<P: ReducerParams>(&mut self, model: &mut CharsModel<P>) -> Result<()> {
        self.network.update(model.network.values_mut())?;
        self.chars.update(&mut model.chars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{
        Initializer,
        layers::{BiRnn, BiRnnParams},
    };
    use rand::{SeedableRng, rngs::StdRng};

    fn model() -> CharsModel<BiRnnParams> {
        let mut rng = StdRng::seed_from_u64(5);
        let init = Initializer::default();
        let chars = EmbeddingsMap::new(3, "abc".chars(), &init, &mut rng).unwrap();
        let network = BiRnnParams::new(3, 2, &init, &mut rng).unwrap();
        CharsModel::new(chars, network).unwrap()
    }

    #[test]
    fn mismatched_network_width_fails() {
        let mut rng = StdRng::seed_from_u64(5);
        let init = Initializer::default();
        let chars = EmbeddingsMap::new(4, "abc".chars(), &init, &mut rng).unwrap();
        let network = BiRnnParams::new(3, 2, &init, &mut rng).unwrap();

        assert!(matches!(
            CharsModel::new(chars, network),
            Err(EncoderErr::WidthMismatch { got: 4, expected: 3, .. })
        ));
    }

    #[test]
    fn every_token_is_encoded_with_the_network_width() {
        let model = model();
        let mut encoder = CharsEncoder::<BiRnn>::new(0, EncoderOptions::default());

        let output = encoder
            .forward(&model, &Sentence::from_forms(["ab", "", "cab"]))
            .unwrap();

        assert_eq!(output.len(), 3);
        assert!(output.iter().all(|y| y.len() == 4));
        assert_eq!(output[1], Array1::<f32>::zeros(4));
    }

    #[test]
    fn network_errors_are_summed_over_tokens() {
        let model = model();
        let sentence = Sentence::from_forms(["ab", "b"]);
        let errors = vec![Array1::ones(4), Array1::from(vec![0.5, -1., 2., 0.])];

        let mut encoder = CharsEncoder::<BiRnn>::new(0, EncoderOptions::default());
        encoder.forward(&model, &sentence).unwrap();
        encoder.backward(&model, &errors).unwrap();
        let grad = encoder.params_errors(false).unwrap();

        let mut expected = vec![0.; model.network().size()];
        for (form, e) in ["ab", "b"].into_iter().zip(&errors) {
            let xs: Vec<_> = form.chars().map(|c| model.chars().get(&c)).collect();
            let mut rnn = BiRnn::new(0);
            rnn.forward(model.network(), &xs).unwrap();
            rnn.backward(model.network(), e).unwrap();
            let g = rnn.params_errors(false).unwrap();
            expected.iter_mut().zip(g).for_each(|(a, g)| *a += g);
        }

        assert_eq!(grad.network, expected);
        let rows: Vec<_> = grad.chars.iter().map(|(row, _)| *row).collect();
        assert_eq!(rows, [1, 2]);
    }

    #[test]
    fn characters_have_no_input_errors() {
        let model = model();
        let options = EncoderOptions::default().with_propagate_to_input(true);
        let mut encoder = CharsEncoder::<BiRnn>::new(0, options);

        encoder.forward(&model, &Sentence::from_forms(["a"])).unwrap();
        encoder.backward(&model, &[Array1::ones(4)]).unwrap();

        assert_eq!(encoder.input_errors(true).unwrap(), InputErrors::NoInputErrors);
    }

    #[test]
    fn optimizer_updates_network_and_touched_chars() {
        let mut model = model();
        let before = model.clone();
        let method = UpdateMethod::GradientDescent { learning_rate: 0.1 };
        let mut optimizer = CharsOptimizer::new(&model, &method);

        let mut encoder = CharsEncoder::<BiRnn>::new(0, EncoderOptions::default());
        encoder.forward(&model, &Sentence::from_forms(["a"])).unwrap();
        encoder.backward(&model, &[Array1::ones(4)]).unwrap();
        optimizer
            .accumulate(&encoder.params_errors(false).unwrap())
            .unwrap();
        optimizer.update(&mut model).unwrap();

        assert_ne!(model.network(), before.network());
        assert_ne!(model.chars().get(&'a'), before.chars().get(&'a'));
        assert_eq!(model.chars().get(&'b'), before.chars().get(&'b'));
    }
}
