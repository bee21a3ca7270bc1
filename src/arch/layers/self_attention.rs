use ndarray::{Array1, Array2, ArrayView2, ArrayViewMut2, Axis, linalg};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    EncoderErr, Result,
    arch::{Initializer, Module, module},
    error::check_len,
    pool::{Cycle, Recycle},
};

const KIND: &str = "self attention";

/// The parameters of a single-head self-attention block with a residual connection:
///
/// `Y = X + softmax(X·Wq (X·Wk)ᵀ / sqrt(d)) · X·Wv · Wo`.
///
/// The flat block holds `Wq, Wk, Wv, Wo`, each of shape `(d, d)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfAttentionParams {
    width: usize,
    values: Vec<f32>,
}

impl SelfAttentionParams {
    pub fn new<R: Rng>(width: usize, init: &Initializer, rng: &mut R) -> Result<Self> {
        let values = init.sample(rng, 4 * width * width, width, width)?.to_vec();
        let params = Self { width, values };

        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 {
            return Err(EncoderErr::ZeroWidth {
                kind: KIND,
                what: "model",
            });
        }

        check_len(KIND, "parameters", self.values.len(), self.size())
    }

    pub fn size(&self) -> usize {
        4 * self.width * self.width
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    fn view_params(&self) -> Result<[ArrayView2<'_, f32>; 4]> {
        let d = self.width;
        let mut chunks = self.values.chunks_exact(d * d);
        let mut next = || ArrayView2::from_shape((d, d), chunks.next().unwrap_or_default());

        Ok([next()?, next()?, next()?, next()?])
    }

    fn view_grad<'a>(&self, grad: &'a mut [f32]) -> Result<[ArrayViewMut2<'a, f32>; 4]> {
        let d = self.width;
        let mut chunks = grad.chunks_exact_mut(d * d);
        let mut next = || ArrayViewMut2::from_shape((d, d), chunks.next().unwrap_or_default());

        Ok([next()?, next()?, next()?, next()?])
    }
}

/// The transient state of a self-attention block applied to one sentence.
#[derive(Debug, Clone)]
pub struct SelfAttention {
    id: usize,
    propagate_to_input: bool,
    cycle: Cycle,

    // Forward metadata
    x: Array2<f32>,
    q: Array2<f32>,
    k: Array2<f32>,
    v: Array2<f32>,
    a: Array2<f32>,
    h: Array2<f32>,

    // Backward metadata
    grad: Option<Vec<f32>>,
    input_errors: Option<Vec<Array1<f32>>>,
}

impl SelfAttention {
    pub fn new(id: usize, propagate_to_input: bool) -> Self {
        let empty = Array2::zeros((0, 0));

        Self {
            id,
            propagate_to_input,
            cycle: Cycle::new(),
            x: empty.clone(),
            q: empty.clone(),
            k: empty.clone(),
            v: empty.clone(),
            a: empty.clone(),
            h: empty,
            grad: None,
            input_errors: None,
        }
    }
}

impl Recycle for SelfAttention {
    fn cycle_mut(&mut self) -> &mut Cycle {
        &mut self.cycle
    }
}

impl Module for SelfAttention {
    type Params = SelfAttentionParams;
    type Input = [Array1<f32>];
    type InputErrors = Vec<Array1<f32>>;
    type ParamsErrors = Vec<f32>;

    fn forward(
        &mut self,
        params: &SelfAttentionParams,
        input: &[Array1<f32>],
    ) -> Result<Vec<Array1<f32>>> {
        let d = params.width;
        for x in input {
            check_len(KIND, "input width", x.len(), d)?;
        }

        let [wq, wk, wv, wo] = params.view_params()?;
        let rows: Vec<_> = input.iter().map(|x| x.view()).collect();
        let x = if rows.is_empty() {
            Array2::zeros((0, d))
        } else {
            ndarray::stack(Axis(0), &rows)?
        };

        self.grad = None;
        self.input_errors = None;
        self.q = x.dot(&wq);
        self.k = x.dot(&wk);
        self.v = x.dot(&wv);

        let mut a = self.q.dot(&self.k.t()) / (d as f32).sqrt();
        for mut row in a.rows_mut() {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            row.mapv_inplace(|s| (s - max).exp());
            let total = row.sum();
            row /= total;
        }

        self.h = a.dot(&self.v);
        let y = &x + &self.h.dot(&wo);
        self.a = a;
        self.x = x;
        self.cycle.forwarded();

        Ok(y.rows().into_iter().map(|r| r.to_owned()).collect())
    }

    fn backward(
        &mut self,
        params: &SelfAttentionParams,
        output_errors: &[Array1<f32>],
    ) -> Result<()> {
        self.cycle.check_forwarded(KIND, self.id)?;
        let d = params.width;
        module::check_errors(KIND, output_errors, self.x.nrows(), d)?;

        let [wq, wk, wv, wo] = params.view_params()?;
        let dy = if output_errors.is_empty() {
            Array2::zeros((0, d))
        } else {
            let rows: Vec<_> = output_errors.iter().map(|e| e.view()).collect();
            ndarray::stack(Axis(0), &rows)?
        };

        let mut grad = vec![0.; params.size()];
        let dh = dy.dot(&wo.t());
        let da = dh.dot(&self.v.t());
        let dv = self.a.t().dot(&dh);

        let scale = 1. / (d as f32).sqrt();
        let mut ds = Array2::<f32>::zeros(self.a.raw_dim());
        for ((mut row, a), da) in ds.rows_mut().into_iter().zip(self.a.rows()).zip(da.rows()) {
            let mean = a.dot(&da);
            row.assign(&(&a * &(&da - mean) * scale));
        }

        let dq = ds.dot(&self.k);
        let dk = ds.t().dot(&self.q);

        {
            let [mut dwq, mut dwk, mut dwv, mut dwo] = params.view_grad(&mut grad)?;
            let xt = self.x.t();
            linalg::general_mat_mul(1., &xt, &dq, 1., &mut dwq);
            linalg::general_mat_mul(1., &xt, &dk, 1., &mut dwk);
            linalg::general_mat_mul(1., &xt, &dv, 1., &mut dwv);
            linalg::general_mat_mul(1., &self.h.t(), &dy, 1., &mut dwo);
        }

        if self.propagate_to_input {
            let dx = dy + dq.dot(&wq.t()) + dk.dot(&wk.t()) + dv.dot(&wv.t());
            self.input_errors = Some(dx.rows().into_iter().map(|r| r.to_owned()).collect());
        }

        self.grad = Some(grad);
        self.cycle.backwarded();
        Ok(())
    }

    fn params_errors(&mut self, copy: bool) -> Result<Vec<f32>> {
        self.cycle.check_backwarded(KIND, "params errors")?;
        module::retrieve(&mut self.grad, copy, KIND, "params errors")
    }

    fn input_errors(&mut self, copy: bool) -> Result<Vec<Array1<f32>>> {
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
