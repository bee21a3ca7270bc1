use log::debug;
use ndarray::{Array1, ArrayView1, Axis, concatenate};
use serde::{Deserialize, Serialize};

use super::{
    Encoder, EncoderModel, EncoderOptimizer, EncoderOptions, EnsembleParamsErrors, InputErrors,
    MergeModel, merge::MergeLayer,
};
use crate::{
    EncoderErr, Result,
    arch::{Module, module},
    error::{check_len, check_structure},
    optimization::{BlockOptimizer, UpdateMethod},
    pool::Cycle,
    sentence::Sentence,
};

const KIND: &str = "ensemble encoder";

/// A branch of an ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub model: EncoderModel,
    /// Whether the parameters of the branch are optimized.
    #[serde(default = "trainable")]
    pub trainable: bool,
}

fn trainable() -> bool {
    true
}

impl Component {
    pub fn trainable(model: EncoderModel) -> Self {
        Self {
            model,
            trainable: true,
        }
    }

    pub fn frozen(model: EncoderModel) -> Self {
        Self {
            model,
            trainable: false,
        }
    }
}

/// Encodes the tokens with every branch and merges their outputs.
///
/// Concatenation, affine, feed-forward and the order-independent merges are all expressed as
/// an ensemble with the matching `MergeModel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleModel {
    components: Vec<Component>,
    merge: MergeModel,
}

impl EnsembleModel {
    /// Creates a new `EnsembleModel`.
    ///
    /// # Returns
    /// The model, or a configuration error if there are no components or their widths don't
    /// fit the merge.
    pub fn new(components: Vec<Component>, merge: MergeModel) -> Result<Self> {
        let model = Self { components, merge };
        model.validate()?;
        Ok(model)
    }

    /// Concatenates the outputs of trainable branches.
    pub fn concat(models: Vec<EncoderModel>) -> Result<Self> {
        Self::new(
            models.into_iter().map(Component::trainable).collect(),
            MergeModel::Concat,
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.components.is_empty() {
            return Err(EncoderErr::EmptyEnsemble);
        }

        for component in &self.components {
            component.model.validate()?;
        }

        self.merge.validate(&self.widths())
    }

    /// The encoding size of every branch, in order.
    pub fn widths(&self) -> Vec<usize> {
        self.components
            .iter()
            .map(|c| c.model.encoding_size())
            .collect()
    }

    pub fn encoding_size(&self) -> usize {
        self.merge.output_size(&self.widths())
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn merge(&self) -> &MergeModel {
        &self.merge
    }
}

/// The transient state of an ensemble over one sentence.
///
/// A branch is backwarded if it is trainable or has to keep propagating the errors to its own
/// input. The parameters errors of frozen branches are never handed out.
#[derive(Debug)]
pub struct EnsembleEncoder {
    id: usize,
    options: EncoderOptions,
    cycle: Cycle,
    branches: Vec<Encoder>,
    trainable: Vec<bool>,
    merge: MergeLayer,

    // Forward metadata
    tokens: usize,

    // Backward metadata
    backwarded: Vec<bool>,
}

impl EnsembleEncoder {
    /// Creates a new `EnsembleEncoder`, building one encoder per branch.
    ///
    /// The branches share the id of the ensemble, their seeds are derived from their index.
    pub fn new(id: usize, model: &EnsembleModel, options: EncoderOptions) -> Result<Self> {
        let branches = model
            .components
            .iter()
            .enumerate()
            .map(|(i, c)| c.model.build_encoder(id, options.for_branch(i)))
            .collect::<Result<Vec<_>>>()?;

        let trainable: Vec<_> = model.components.iter().map(|c| c.trainable).collect();
        let propagate = options.propagate_to_input || trainable.contains(&true);

        Ok(Self {
            id,
            options,
            cycle: Cycle::new(),
            merge: MergeLayer::new(id, &model.merge, propagate),
            backwarded: vec![false; branches.len()],
            branches,
            trainable,
            tokens: 0,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn forward(
        &mut self,
        model: &EnsembleModel,
        sentence: &Sentence,
    ) -> Result<Vec<Array1<f32>>> {
        check_len(KIND, "components", model.components.len(), self.branches.len())?;

        let outputs = self
            .branches
            .iter_mut()
            .zip(&model.components)
            .map(|(branch, c)| branch.forward(&c.model, sentence))
            .collect::<Result<Vec<_>>>()?;

        self.backwarded.fill(false);
        self.tokens = sentence.len();

        let output = self.merge.forward(&model.merge, outputs)?;
        self.cycle.forwarded();
        Ok(output)
    }

    pub fn backward(&mut self, model: &EnsembleModel, errors: &[Array1<f32>]) -> Result<()> {
        self.cycle.check_forwarded(KIND, self.id)?;
        module::check_errors(KIND, errors, self.tokens, model.encoding_size())?;

        let Some(branch_errors) = self.merge.backward(&model.merge, errors)? else {
            self.cycle.backwarded();
            return Ok(());
        };

        for (i, ((branch, c), e)) in self
            .branches
            .iter_mut()
            .zip(&model.components)
            .zip(branch_errors)
            .enumerate()
        {
            if self.trainable[i] || branch.propagate_to_input() {
                branch.backward(&c.model, &e)?;
                self.backwarded[i] = true;
            }
        }

        self.cycle.backwarded();
        Ok(())
    }

    /// The errors of the merge and of the trainable branches.
    pub fn params_errors(&mut self, copy: bool) -> Result<EnsembleParamsErrors> {
        self.cycle.check_backwarded(KIND, "params errors")?;

        let merge = self.merge.params_errors(copy)?;
        let branches = self
            .branches
            .iter_mut()
            .zip(&self.trainable)
            .map(|(branch, &trainable)| {
                trainable.then(|| branch.params_errors(copy)).transpose()
            })
            .collect::<Result<_>>()?;

        Ok(EnsembleParamsErrors { merge, branches })
    }

    /// The errors of every token input, the concatenation of the errors of the branches that
    /// have any.
    pub fn input_errors(&mut self, copy: bool) -> Result<InputErrors> {
        if !self.options.propagate_to_input {
            return Err(EncoderErr::InputErrorsDisabled {
                kind: KIND,
                id: self.id,
            });
        }

        self.cycle.check_backwarded(KIND, "input errors")?;

        let mut per_branch = Vec::with_capacity(self.branches.len());
        for (branch, &backwarded) in self.branches.iter_mut().zip(&self.backwarded) {
            if !backwarded {
                return Err(EncoderErr::ErrorsUnavailable {
                    kind: KIND,
                    what: "branch input errors",
                });
            }

            if let InputErrors::Tokens(errors) = branch.input_errors(copy)? {
                per_branch.push(errors);
            }
        }

        if per_branch.is_empty() {
            return Ok(InputErrors::NoInputErrors);
        }

        let tokens = (0..self.tokens)
            .map(|t| {
                let views: Vec<ArrayView1<f32>> =
                    per_branch.iter().map(|errors| errors[t].view()).collect();
                Ok(concatenate(Axis(0), &views)?)
            })
            .collect::<Result<_>>()?;

        Ok(InputErrors::Tokens(tokens))
    }

    pub fn propagate_to_input(&self) -> bool {
        self.options.propagate_to_input
    }

    pub(super) fn cycle_mut(&mut self) -> &mut Cycle {
        &mut self.cycle
    }
}

/// Optimizes the merge and the trainable branches of an ensemble.
#[derive(Debug)]
pub struct EnsembleOptimizer {
    merge: Option<BlockOptimizer>,
    branches: Vec<Option<EncoderOptimizer>>,
}

impl EnsembleOptimizer {
    pub fn new(model: &EnsembleModel, method: &UpdateMethod) -> Result<Self> {
        let merge = model
            .merge
            .params()
            .map(|params| BlockOptimizer::new(method, params.size()));

        let mut branches = Vec::with_capacity(model.components.len());
        for (i, c) in model.components.iter().enumerate() {
            if c.trainable {
                branches.push(Some(c.model.build_optimizer(method)?));
            } else {
                debug!(branch = i, kind = c.model.kind(); "skipping optimizer of frozen branch");
                branches.push(None);
            }
        }

        Ok(Self { merge, branches })
    }

    /// Whether the branch at `index` has an optimizer.
    pub fn optimizes(&self, index: usize) -> bool {
        matches!(self.branches.get(index), Some(Some(_)))
    }

    pub fn accumulate(&mut self, errors: &EnsembleParamsErrors) -> Result<()> {
        check_len(KIND, "branches errors", errors.branches.len(), self.branches.len())?;
        check_structure(KIND, "merge", self.merge.is_some(), errors.merge.is_some())?;
        for (optimizer, errors) in self.branches.iter().zip(&errors.branches) {
            check_structure(KIND, "branch", optimizer.is_some(), errors.is_some())?;
        }

        if let (Some(optimizer), Some(grad)) = (&mut self.merge, &errors.merge) {
            optimizer.accumulate(grad)?;
        }

        for (optimizer, errors) in self.branches.iter_mut().zip(&errors.branches) {
            if let (Some(optimizer), Some(errors)) = (optimizer, errors) {
                optimizer.accumulate(errors)?;
            }
        }

        Ok(())
    }

    pub fn update(&mut self, model: &mut EnsembleModel) -> Result<()> {
        if let (Some(optimizer), Some(params)) = (&mut self.merge, model.merge.params_mut()) {
            optimizer.update(params.values_mut())?;
        }

        for (optimizer, c) in self.branches.iter_mut().zip(&mut model.components) {
            if let Some(optimizer) = optimizer {
                optimizer.update(&mut c.model)?;
            }
        }

        Ok(())
    }
}
