use ndarray::{Array1, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis, linalg};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    EncoderErr, Result,
    arch::{
        Initializer,
        layers::{ReducerParams, SequenceReducer},
        module,
    },
    error::check_len,
    pool::{Cycle, Recycle},
};

const KIND: &str = "attention";

/// The parameters of an additive attention reducer:
///
/// `u_t = tanh(x_t · Wa + ba)`, `a = softmax(u_t · c)`, `y = (sum a_t x_t) · Wo + bo`.
///
/// The flat block is laid out as `Wa, ba, c, Wo, bo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionParams {
    input: usize,
    attention: usize,
    output: usize,
    values: Vec<f32>,
}

impl AttentionParams {
    pub fn new<R: Rng>(
        input: usize,
        attention: usize,
        output: usize,
        init: &Initializer,
        rng: &mut R,
    ) -> Result<Self> {
        let mut values = Vec::with_capacity((input + 2) * attention + (input + 1) * output);
        values.extend(init.sample(rng, input * attention, input, attention)?);
        values.extend(std::iter::repeat_n(0., attention));
        values.extend(init.sample(rng, attention, attention, 1)?);
        values.extend(init.sample(rng, input * output, input, output)?);
        values.extend(std::iter::repeat_n(0., output));

        let params = Self {
            input,
            attention,
            output,
            values,
        };

        params.validate()?;
        Ok(params)
    }

    fn view_params(&self) -> Result<AttentionView<'_>> {
        let (wa, rest) = self.values.split_at(self.input * self.attention);
        let (ba, rest) = rest.split_at(self.attention);
        let (c, rest) = rest.split_at(self.attention);
        let (wo, bo) = rest.split_at(self.input * self.output);

        Ok(AttentionView {
            wa: ArrayView2::from_shape((self.input, self.attention), wa)?,
            ba: ArrayView1::from(ba),
            c: ArrayView1::from(c),
            wo: ArrayView2::from_shape((self.input, self.output), wo)?,
            bo: ArrayView1::from(bo),
        })
    }

    fn view_grad<'a>(&self, grad: &'a mut [f32]) -> Result<AttentionGradView<'a>> {
        let (dwa, rest) = grad.split_at_mut(self.input * self.attention);
        let (dba, rest) = rest.split_at_mut(self.attention);
        let (dc, rest) = rest.split_at_mut(self.attention);
        let (dwo, dbo) = rest.split_at_mut(self.input * self.output);

        Ok(AttentionGradView {
            dwa: ArrayViewMut2::from_shape((self.input, self.attention), dwa)?,
            dba: ArrayViewMut1::from(dba),
            dc: ArrayViewMut1::from(dc),
            dwo: ArrayViewMut2::from_shape((self.input, self.output), dwo)?,
            dbo: ArrayViewMut1::from(dbo),
        })
    }
}

impl ReducerParams for AttentionParams {
    fn input(&self) -> usize {
        self.input
    }

    fn output(&self) -> usize {
        self.output
    }

    fn size(&self) -> usize {
        (self.input + 2) * self.attention + (self.input + 1) * self.output
    }

    fn validate(&self) -> Result<()> {
        if self.input == 0 || self.attention == 0 || self.output == 0 {
            return Err(EncoderErr::ZeroWidth {
                kind: KIND,
                what: "input, attention and output layers",
            });
        }

        check_len(KIND, "parameters", self.values.len(), self.size())
    }

    fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }
}

struct AttentionView<'a> {
    wa: ArrayView2<'a, f32>,
    ba: ArrayView1<'a, f32>,
    c: ArrayView1<'a, f32>,
    wo: ArrayView2<'a, f32>,
    bo: ArrayView1<'a, f32>,
}

struct AttentionGradView<'a> {
    dwa: ArrayViewMut2<'a, f32>,
    dba: ArrayViewMut1<'a, f32>,
    dc: ArrayViewMut1<'a, f32>,
    dwo: ArrayViewMut2<'a, f32>,
    dbo: ArrayViewMut1<'a, f32>,
}

/// Reduces a sequence of vectors into one through additive attention.
#[derive(Debug, Clone)]
pub struct Attention {
    id: usize,
    cycle: Cycle,

    // Forward metadata
    xs: Vec<Array1<f32>>,
    us: Vec<Array1<f32>>,
    alphas: Array1<f32>,
    v: Array1<f32>,

    // Backward metadata
    grad: Option<Vec<f32>>,
    input_errors: Option<Vec<Array1<f32>>>,
}

impl SequenceReducer for Attention {
    type Params = AttentionParams;

    fn new(id: usize) -> Self {
        Self {
            id,
            cycle: Cycle::new(),
            xs: Vec::new(),
            us: Vec::new(),
            alphas: Array1::zeros(0),
            v: Array1::zeros(0),
            grad: None,
            input_errors: None,
        }
    }

    /// Reduces `xs`; an empty sequence yields the output biases.
    fn forward(
        &mut self,
        params: &AttentionParams,
        xs: &[Array1<f32>],
    ) -> Result<Array1<f32>> {
        for x in xs {
            check_len(KIND, "input width", x.len(), params.input)?;
        }

        let view = params.view_params()?;
        self.xs.clear();
        self.xs.extend_from_slice(xs);
        self.grad = None;
        self.input_errors = None;

        self.us = xs
            .iter()
            .map(|x| (x.dot(&view.wa) + view.ba).mapv_into(f32::tanh))
            .collect();

        let scores: Array1<f32> = self.us.iter().map(|u| u.dot(&view.c)).collect();
        self.alphas = softmax(&scores);

        let mut v = Array1::zeros(params.input);
        for (x, &a) in xs.iter().zip(&self.alphas) {
            v.scaled_add(a, x);
        }

        let y = v.dot(&view.wo) + view.bo;
        self.v = v;
        self.cycle.forwarded();

        Ok(y)
    }

    fn backward(&mut self, params: &AttentionParams, errors: &Array1<f32>) -> Result<()> {
        self.cycle.check_forwarded(KIND, self.id)?;
        check_len(KIND, "output errors width", errors.len(), params.output)?;

        let view = params.view_params()?;
        let mut grad = vec![0.; params.size()];
        let mut input_errors = Vec::with_capacity(self.xs.len());

        {
            let mut dview = params.view_grad(&mut grad)?;

            let e_row = errors.view().insert_axis(Axis(0));
            let v_col = self.v.view().insert_axis(Axis(1));
            linalg::general_mat_mul(1., &v_col, &e_row, 1., &mut dview.dwo);
            dview.dbo += errors;

            let dv = view.wo.dot(errors);
            let dalphas: Array1<f32> = self.xs.iter().map(|x| dv.dot(x)).collect();
            let mean = self.alphas.dot(&dalphas);

            for ((x, u), (&a, &da)) in self
                .xs
                .iter()
                .zip(&self.us)
                .zip(self.alphas.iter().zip(&dalphas))
            {
                let ds = a * (da - mean);
                dview.dc.scaled_add(ds, u);

                let mut dz = view.c.to_owned() * ds;
                dz.zip_mut_with(u, |d, &u| *d *= 1. - u * u);

                let dz_row = dz.view().insert_axis(Axis(0));
                let x_col = x.view().insert_axis(Axis(1));
                linalg::general_mat_mul(1., &x_col, &dz_row, 1., &mut dview.dwa);
                dview.dba += &dz;

                let mut dx = view.wa.dot(&dz);
                dx.scaled_add(a, &dv);
                input_errors.push(dx);
            }
        }

        self.grad = Some(grad);
        self.input_errors = Some(input_errors);
        self.cycle.backwarded();
        Ok(())
    }

    fn params_errors(&mut self, copy: bool) -> Result<Vec<f32>> {
        self.cycle.check_backwarded(KIND, "params errors")?;
        module::retrieve(&mut self.grad, copy, KIND, "params errors")
    }

    fn input_errors(&mut self, copy: bool) -> Result<Vec<Array1<f32>>> {
        self.cycle.check_backwarded(KIND, "input errors")?;
        module::retrieve(&mut self.input_errors, copy, KIND, "input errors")
    }
}

impl Recycle for Attention {
    fn cycle_mut(&mut self) -> &mut Cycle {
        &mut self.cycle
    }
}

/// Numerically stable softmax, empty for an empty input.
fn softmax(scores: &Array1<f32>) -> Array1<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps = scores.mapv(|s| (s - max).exp());
    let total = exps.sum();
    exps / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::{SeedableRng, rngs::StdRng};

    fn params() -> AttentionParams {
        let mut rng = StdRng::seed_from_u64(11);
        AttentionParams::new(2, 3, 2, &Initializer::default(), &mut rng).unwrap()
    }

    fn loss(params: &AttentionParams, xs: &[Array1<f32>]) -> f32 {
        let y = Attention::new(0).forward(params, xs).unwrap();
        y[0] - 2. * y[1]
    }

    #[test]
    fn softmax_sums_to_one() {
        let alphas = softmax(&array![1., 2., 3.]);
        assert!((alphas.sum() - 1.).abs() < 1e-6);
        assert!(alphas[2] > alphas[1] && alphas[1] > alphas[0]);
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut params = params();
        let xs = vec![array![0.5, -1.], array![0.2, 0.8], array![-0.7, 0.1]];

        let mut attention = Attention::new(0);
        attention.forward(&params, &xs).unwrap();
        attention.backward(&params, &array![1., -2.]).unwrap();
        let grad = attention.params_errors(false).unwrap();
        let dxs = attention.input_errors(false).unwrap();

        let h = 1e-2;
        for i in 0..params.size() {
            let orig = params.values[i];
            params.values[i] = orig + h;
            let plus = loss(&params, &xs);
            params.values[i] = orig - h;
            let minus = loss(&params, &xs);
            params.values[i] = orig;

            let numeric = (plus - minus) / (2. * h);
            assert!((numeric - grad[i]).abs() < 1e-2, "param {i}: {numeric} vs {}", grad[i]);
        }

        let mut shifted = xs.clone();
        shifted[2][1] += h;
        let plus = loss(&params, &shifted);
        shifted[2][1] -= 2. * h;
        let minus = loss(&params, &shifted);
        assert!(((plus - minus) / (2. * h) - dxs[2][1]).abs() < 1e-2);
    }

    #[test]
    fn empty_sequences_yield_the_output_biases() {
        let mut params = params();
        let n = params.size();
        params.values_mut()[n - 2..].copy_from_slice(&[0.25, -0.5]);

        let y = Attention::new(0).forward(&params, &[]).unwrap();
        assert_eq!(y, array![0.25f32, -0.5]);
    }
}
