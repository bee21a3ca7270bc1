use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::{
    Encoder, EncoderModel, EncoderOptimizer, EncoderOptions, InputErrors, ReductionParamsErrors,
};
use crate::{
    EncoderErr, Result,
    arch::{
        Module,
        layers::{Dense, DenseParams},
    },
    error::check_structure,
    optimization::{BlockOptimizer, UpdateMethod},
    pool::Cycle,
    sentence::Sentence,
};

const KIND: &str = "reduction encoder";

/// Projects the output of another encoder through a dense layer, usually into a smaller one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReductionModel {
    input: Box<EncoderModel>,
    reduction: DenseParams,
    /// Whether the parameters of the input encoder are optimized too.
    #[serde(default)]
    optimize_input: bool,
}

impl ReductionModel {
    pub fn new(input: EncoderModel, reduction: DenseParams, optimize_input: bool) -> Result<Self> {
        let model = Self {
            input: Box::new(input),
            reduction,
            optimize_input,
        };

        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> Result<()> {
        self.input.validate()?;
        self.reduction.validate()?;

        if self.reduction.inputs() != [self.input.encoding_size()] {
            return Err(EncoderErr::WidthMismatch {
                kind: KIND,
                what: "reduction input",
                got: self.reduction.input_size(),
                expected: self.input.encoding_size(),
            });
        }

        Ok(())
    }

    pub fn encoding_size(&self) -> usize {
        self.reduction.output()
    }

    pub fn input(&self) -> &EncoderModel {
        &self.input
    }

    pub fn reduction(&self) -> &DenseParams {
        &self.reduction
    }

    pub fn optimize_input(&self) -> bool {
        self.optimize_input
    }
}

#[derive(Debug)]
pub struct ReductionEncoder {
    id: usize,
    optimize_input: bool,
    cycle: Cycle,
    input: Box<Encoder>,
    dense: Dense,
}

impl ReductionEncoder {
    pub fn new(id: usize, model: &ReductionModel, options: EncoderOptions) -> Result<Self> {
        let input = model.input.build_encoder(id, options)?;
        let propagate = model.optimize_input || input.propagate_to_input();

        Ok(Self {
            id,
            optimize_input: model.optimize_input,
            cycle: Cycle::new(),
            input: Box::new(input),
            dense: Dense::new(id, propagate),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn forward(
        &mut self,
        model: &ReductionModel,
        sentence: &Sentence,
    ) -> Result<Vec<Array1<f32>>> {
        let xs = self.input.forward(&model.input, sentence)?;
        let output = self.dense.forward_single(&model.reduction, &xs)?;
        self.cycle.forwarded();
        Ok(output)
    }

    pub fn backward(&mut self, model: &ReductionModel, errors: &[Array1<f32>]) -> Result<()> {
        self.cycle.check_forwarded(KIND, self.id)?;
        self.dense.backward(&model.reduction, errors)?;

        if self.dense.propagate_to_input() {
            let input_errors = self.dense.single_input_errors(false)?;
            self.input.backward(&model.input, &input_errors)?;
        }

        self.cycle.backwarded();
        Ok(())
    }

    /// The errors of the reduction layer, and of the input encoder if it is optimized.
    pub fn params_errors(&mut self, copy: bool) -> Result<ReductionParamsErrors> {
        self.cycle.check_backwarded(KIND, "params errors")?;

        let input = if self.optimize_input {
            Some(Box::new(self.input.params_errors(copy)?))
        } else {
            None
        };

        Ok(ReductionParamsErrors {
            input,
            reduction: self.dense.params_errors(copy)?,
        })
    }

    /// The input errors of the inner encoder.
    pub fn input_errors(&mut self, copy: bool) -> Result<InputErrors> {
        if !self.input.propagate_to_input() {
            return Err(EncoderErr::InputErrorsDisabled {
                kind: KIND,
                id: self.id,
            });
        }

        self.cycle.check_backwarded(KIND, "input errors")?;
        self.input.input_errors(copy)
    }

    pub fn propagate_to_input(&self) -> bool {
        self.input.propagate_to_input()
    }

    pub(super) fn cycle_mut(&mut self) -> &mut Cycle {
        &mut self.cycle
    }
}

#[derive(Debug)]
pub struct ReductionOptimizer {
    input: Option<Box<EncoderOptimizer>>,
    reduction: BlockOptimizer,
}

impl ReductionOptimizer {
    pub fn new(model: &ReductionModel, method: &UpdateMethod) -> Result<Self> {
        let input = if model.optimize_input {
            Some(Box::new(model.input.build_optimizer(method)?))
        } else {
            None
        };

        Ok(Self {
            input,
            reduction: BlockOptimizer::new(method, model.reduction.size()),
        })
    }

    pub fn accumulate(&mut self, errors: &ReductionParamsErrors) -> Result<()> {
        check_structure(KIND, "input", self.input.is_some(), errors.input.is_some())?;

        if let (Some(optimizer), Some(errors)) = (&mut self.input, &errors.input) {
            optimizer.accumulate(errors)?;
        }

        self.reduction.accumulate(&errors.reduction)
    }

    pub fn update(&mut self, model: &mut ReductionModel) -> Result<()> {
        if let Some(optimizer) = &mut self.input {
            optimizer.update(&mut model.input)?;
        }

        self.reduction.update(model.reduction.values_mut())
    }
}
