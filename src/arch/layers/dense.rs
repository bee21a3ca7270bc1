use ndarray::{Array1, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis, linalg};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    EncoderErr, Result,
    arch::{Initializer, Module, activations::ActFn, module},
    error::check_len,
    pool::{Cycle, Recycle},
};

const KIND: &str = "dense layer";

/// The parameters of a dense layer with one or more separate inputs:
/// `y = act(x_1 · W_1 + ... + x_k · W_k + b)`.
///
/// Weights and biases are kept in a single flat block laid out as `W_1, ..., W_k, b`, each
/// matrix in row-major order with shape `(input_i, output)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseParams {
    inputs: Vec<usize>,
    output: usize,
    act_fn: Option<ActFn>,
    values: Vec<f32>,
}

impl DenseParams {
    /// Creates new `DenseParams` with zero biases.
    ///
    /// # Arguments
    /// * `inputs` - The width of each separate input.
    /// * `output` - The width of the output.
    /// * `act_fn` - The activation applied to the weighted sums.
    /// * `init` - The initializer of the weights.
    /// * `rng` - A random number generator.
    ///
    /// # Returns
    /// The parameters, or a configuration error if any width is zero.
    pub fn new<R: Rng>(
        inputs: Vec<usize>,
        output: usize,
        act_fn: Option<ActFn>,
        init: &Initializer,
        rng: &mut R,
    ) -> Result<Self> {
        let input_size: usize = inputs.iter().sum();
        let w_size = input_size * output;
        let mut values = init.sample(rng, w_size, input_size, output)?.to_vec();
        values.resize(w_size + output, 0.);

        let params = Self {
            inputs,
            output,
            act_fn,
            values,
        };

        params.validate()?;
        Ok(params)
    }

    /// Creates new `DenseParams` with a single input.
    pub fn linear<R: Rng>(
        input: usize,
        output: usize,
        act_fn: Option<ActFn>,
        init: &Initializer,
        rng: &mut R,
    ) -> Result<Self> {
        Self::new(vec![input], output, act_fn, init, rng)
    }

    /// Checks the structural invariants of the parameters.
    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() || self.inputs.contains(&0) {
            return Err(EncoderErr::ZeroWidth {
                kind: KIND,
                what: "input",
            });
        }

        if self.output == 0 {
            return Err(EncoderErr::ZeroWidth {
                kind: KIND,
                what: "output",
            });
        }

        check_len(KIND, "parameters", self.values.len(), self.size())
    }

    /// The amount of parameters of the layer.
    pub fn size(&self) -> usize {
        (self.input_size() + 1) * self.output
    }

    pub fn inputs(&self) -> &[usize] {
        &self.inputs
    }

    /// The width of all the inputs together.
    pub fn input_size(&self) -> usize {
        self.inputs.iter().sum()
    }

    pub fn output(&self) -> usize {
        self.output
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    /// Gives a view of the flat block as the weights of each input and the biases.
    fn view_params(&self) -> Result<(Vec<ArrayView2<'_, f32>>, ArrayView1<'_, f32>)> {
        let mut rest = &self.values[..];
        let mut weights = Vec::with_capacity(self.inputs.len());

        for &n in &self.inputs {
            let (w, tail) = rest.split_at(n * self.output);
            weights.push(ArrayView2::from_shape((n, self.output), w)?);
            rest = tail;
        }

        Ok((weights, ArrayView1::from(rest)))
    }

    /// Gives a view of a gradient block as the delta weights of each input and delta biases.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(Vec<ArrayViewMut2<'a, f32>>, ArrayViewMut1<'a, f32>)> {
        let mut rest = grad;
        let mut weights = Vec::with_capacity(self.inputs.len());

        for &n in &self.inputs {
            let (w, tail) = rest.split_at_mut(n * self.output);
            weights.push(ArrayViewMut2::from_shape((n, self.output), w)?);
            rest = tail;
        }

        Ok((weights, ArrayViewMut1::from(rest)))
    }
}

/// The transient state of a dense layer applied to a sequence of elements.
///
/// Parameters errors are summed over the elements of the sequence.
#[derive(Debug, Clone)]
pub struct Dense {
    id: usize,
    propagate_to_input: bool,
    cycle: Cycle,

    // Forward metadata
    xs: Vec<Vec<Array1<f32>>>,
    zs: Vec<Array1<f32>>,

    // Backward metadata
    grad: Option<Vec<f32>>,
    input_errors: Option<Vec<Vec<Array1<f32>>>>,
}

impl Dense {
    /// Creates a new `Dense`.
    ///
    /// # Arguments
    /// * `id` - The identifier of this instance.
    /// * `propagate_to_input` - Whether to compute the errors with respect to the inputs.
    pub fn new(id: usize, propagate_to_input: bool) -> Self {
        Self {
            id,
            propagate_to_input,
            cycle: Cycle::new(),
            xs: Vec::new(),
            zs: Vec::new(),
            grad: None,
            input_errors: None,
        }
    }

    /// Forwards a sequence of single-input elements.
    pub fn forward_single(
        &mut self,
        params: &DenseParams,
        xs: &[Array1<f32>],
    ) -> Result<Vec<Array1<f32>>> {
        let input: Vec<_> = xs.iter().map(|x| vec![x.clone()]).collect();
        self.forward(params, &input)
    }

    /// Takes the input errors of a single-input layer.
    pub fn single_input_errors(&mut self, copy: bool) -> Result<Vec<Array1<f32>>> {
        let errors = self.input_errors(copy)?;
        Ok(errors
            .into_iter()
            .map(|mut e| e.swap_remove(0))
            .collect())
    }
}

impl Recycle for Dense {
    fn cycle_mut(&mut self) -> &mut Cycle {
        &mut self.cycle
    }
}

impl Module for Dense {
    type Params = DenseParams;
    type Input = [Vec<Array1<f32>>];
    type InputErrors = Vec<Vec<Array1<f32>>>;
    type ParamsErrors = Vec<f32>;

    fn forward(
        &mut self,
        params: &DenseParams,
        input: &[Vec<Array1<f32>>],
    ) -> Result<Vec<Array1<f32>>> {
        let (weights, biases) = params.view_params()?;
        let mut output = Vec::with_capacity(input.len());

        self.xs.clear();
        self.zs.clear();
        self.grad = None;
        self.input_errors = None;

        for xs in input {
            check_len(KIND, "inputs", xs.len(), weights.len())?;

            let mut z = biases.to_owned();
            for (x, w) in xs.iter().zip(&weights) {
                check_len(KIND, "input width", x.len(), w.nrows())?;
                z += &x.dot(w);
            }

            let a = match &params.act_fn {
                Some(act_fn) => z.mapv(|z| act_fn.f(z)),
                None => z.clone(),
            };

            self.xs.push(xs.clone());
            self.zs.push(z);
            output.push(a);
        }

        self.cycle.forwarded();
        Ok(output)
    }

    fn backward(&mut self, params: &DenseParams, output_errors: &[Array1<f32>]) -> Result<()> {
        self.cycle.check_forwarded(KIND, self.id)?;
        module::check_errors(KIND, output_errors, self.zs.len(), params.output)?;

        let (weights, _) = params.view_params()?;
        let mut grad = vec![0.; params.size()];
        let mut input_errors = Vec::with_capacity(output_errors.len());

        {
            let (mut dws, mut db) = params.view_grad(&mut grad)?;

            for ((xs, z), e) in self.xs.iter().zip(&self.zs).zip(output_errors) {
                let mut d = e.clone();
                if let Some(act_fn) = &params.act_fn {
                    d.zip_mut_with(z, |d, &z| *d *= act_fn.df(z));
                }

                let d_row = d.view().insert_axis(Axis(0));
                for (x, dw) in xs.iter().zip(dws.iter_mut()) {
                    let x_col = x.view().insert_axis(Axis(1));
                    linalg::general_mat_mul(1., &x_col, &d_row, 1., dw);
                }
                db += &d;

                if self.propagate_to_input {
                    input_errors.push(weights.iter().map(|w| w.dot(&d)).collect());
                }
            }
        }

        self.grad = Some(grad);
        self.input_errors = self.propagate_to_input.then_some(input_errors);
        self.cycle.backwarded();
        Ok(())
    }

    fn params_errors(&mut self, copy: bool) -> Result<Vec<f32>> {
        self.cycle.check_backwarded(KIND, "params errors")?;
        module::retrieve(&mut self.grad, copy, KIND, "params errors")
    }

    fn input_errors(&mut self, copy: bool) -> Result<Vec<Vec<Array1<f32>>>> {
        if !self.propagate_to_input {
            return Err(EncoderErr::InputErrorsDisabled {
                kind: KIND,
                id: self.id,
            });
        }

        self.cycle.check_backwarded(KIND, "input errors")?;
        module::retrieve(&mut self.input_errors, copy, KIND, "input errors")
    }

    fn propagate_to_input(&self) -> bool {
        self.propagate_to_input
    }
}
