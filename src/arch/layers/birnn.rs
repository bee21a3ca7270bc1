use ndarray::{
    Array1, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis, concatenate, linalg, s,
};
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

const KIND: &str = "birnn";

/// The parameters of a bidirectional Elman network with `tanh` hidden units.
///
/// Each direction owns `Wx (input, hidden)`, `Wh (hidden, hidden)` and `b (hidden)`, the left to
/// right direction first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiRnnParams {
    input: usize,
    hidden: usize,
    values: Vec<f32>,
}

impl BiRnnParams {
    pub fn new<R: Rng>(
        input: usize,
        hidden: usize,
        init: &Initializer,
        rng: &mut R,
    ) -> Result<Self> {
        if input == 0 || hidden == 0 {
            return Err(EncoderErr::ZeroWidth {
                kind: KIND,
                what: "input and hidden layers",
            });
        }

        let mut values = Vec::with_capacity(2 * Self::direction_size(input, hidden));
        for _ in 0..2 {
            values.extend(init.sample(rng, input * hidden, input, hidden)?);
            values.extend(init.sample(rng, hidden * hidden, hidden, hidden)?);
            values.extend(std::iter::repeat_n(0., hidden));
        }

        Ok(Self {
            input,
            hidden,
            values,
        })
    }

    fn direction_size(input: usize, hidden: usize) -> usize {
        (input + hidden + 1) * hidden
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    fn view_direction(&self, direction: usize) -> Result<RnnView<'_>> {
        let size = Self::direction_size(self.input, self.hidden);
        let block = &self.values[direction * size..(direction + 1) * size];
        let (wx, rest) = block.split_at(self.input * self.hidden);
        let (wh, b) = rest.split_at(self.hidden * self.hidden);

        Ok(RnnView {
            wx: ArrayView2::from_shape((self.input, self.hidden), wx)?,
            wh: ArrayView2::from_shape((self.hidden, self.hidden), wh)?,
            b: ArrayView1::from(b),
        })
    }

    fn view_direction_grad<'a>(&self, grad: &'a mut [f32]) -> Result<RnnGradView<'a>> {
        let (dwx, rest) = grad.split_at_mut(self.input * self.hidden);
        let (dwh, db) = rest.split_at_mut(self.hidden * self.hidden);

        Ok(RnnGradView {
            dwx: ArrayViewMut2::from_shape((self.input, self.hidden), dwx)?,
            dwh: ArrayViewMut2::from_shape((self.hidden, self.hidden), dwh)?,
            db: ArrayViewMut1::from(db),
        })
    }
}

impl ReducerParams for BiRnnParams {
    fn input(&self) -> usize {
        self.input
    }

    /// The width of the encoding, both last hidden states concatenated.
    fn output(&self) -> usize {
        2 * self.hidden
    }

    fn size(&self) -> usize {
        2 * Self::direction_size(self.input, self.hidden)
    }

    fn validate(&self) -> Result<()> {
        if self.input == 0 || self.hidden == 0 {
            return Err(EncoderErr::ZeroWidth {
                kind: KIND,
                what: "input and hidden layers",
            });
        }

        check_len(KIND, "parameters", self.values.len(), self.size())
    }

    fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }
}

struct RnnView<'a> {
    wx: ArrayView2<'a, f32>,
    wh: ArrayView2<'a, f32>,
    b: ArrayView1<'a, f32>,
}

struct RnnGradView<'a> {
    dwx: ArrayViewMut2<'a, f32>,
    dwh: ArrayViewMut2<'a, f32>,
    db: ArrayViewMut1<'a, f32>,
}

/// The hidden states of one direction, in processing order.
#[derive(Debug, Clone, Default)]
struct Trace {
    hs: Vec<Array1<f32>>,
}

impl Trace {
    fn run<'x, I>(&mut self, view: &RnnView<'_>, xs: I)
    where
        I: Iterator<Item = &'x Array1<f32>>,
    {
        self.hs.clear();
        let mut h = Array1::zeros(view.b.len());

        for x in xs {
            let mut z = view.b.to_owned();
            z += &x.dot(&view.wx);
            z += &h.dot(&view.wh);
            h = z.mapv_into(f32::tanh);
            self.hs.push(h.clone());
        }
    }

    fn last(&self, hidden: usize) -> Array1<f32> {
        self.hs
            .last()
            .cloned()
            .unwrap_or_else(|| Array1::zeros(hidden))
    }

    /// Backpropagates through time, returning the input errors in processing order.
    fn backward<'x, I>(
        &self,
        view: &RnnView<'_>,
        grad: &mut RnnGradView<'_>,
        xs: I,
        dh_last: ArrayView1<f32>,
    ) -> Vec<Array1<f32>>
    where
        I: Iterator<Item = &'x Array1<f32>>,
    {
        let xs: Vec<_> = xs.collect();
        let mut dxs = Vec::with_capacity(xs.len());
        let mut dh = dh_last.to_owned();
        let zeros = Array1::zeros(dh.len());

        for (t, x) in xs.into_iter().enumerate().rev() {
            let h = &self.hs[t];
            let h_prev = if t == 0 { &zeros } else { &self.hs[t - 1] };

            let mut dz = dh;
            dz.zip_mut_with(h, |d, &h| *d *= 1. - h * h);

            let dz_row = dz.view().insert_axis(Axis(0));
            let x_col = x.view().insert_axis(Axis(1));
            let h_col = h_prev.view().insert_axis(Axis(1));
            linalg::general_mat_mul(1., &x_col, &dz_row, 1., &mut grad.dwx);
            linalg::general_mat_mul(1., &h_col, &dz_row, 1., &mut grad.dwh);
            grad.db += &dz;

            dxs.push(view.wx.dot(&dz));
            dh = view.wh.dot(&dz);
        }

        dxs.reverse();
        dxs
    }
}

/// A bidirectional recurrent encoder of a single sequence into one vector, the concatenation of
/// the last hidden state of each direction.
#[derive(Debug, Clone)]
pub struct BiRnn {
    id: usize,
    cycle: Cycle,

    // Forward metadata
    xs: Vec<Array1<f32>>,
    left_to_right: Trace,
    right_to_left: Trace,

    // Backward metadata
    grad: Option<Vec<f32>>,
    input_errors: Option<Vec<Array1<f32>>>,
}

impl SequenceReducer for BiRnn {
    type Params = BiRnnParams;

    fn new(id: usize) -> Self {
        Self {
            id,
            cycle: Cycle::new(),
            xs: Vec::new(),
            left_to_right: Trace::default(),
            right_to_left: Trace::default(),
            grad: None,
            input_errors: None,
        }
    }

    /// Encodes a sequence of vectors.
    ///
    /// # Arguments
    /// * `params` - The parameters of the network.
    /// * `xs` - The input sequence, possibly empty.
    ///
    /// # Returns
    /// The encoding of width `2 * hidden`.
    fn forward(&mut self, params: &BiRnnParams, xs: &[Array1<f32>]) -> Result<Array1<f32>> {
        for x in xs {
            check_len(KIND, "input width", x.len(), params.input)?;
        }

        self.xs.clear();
        self.xs.extend_from_slice(xs);
        self.grad = None;
        self.input_errors = None;

        self.left_to_right
            .run(&params.view_direction(0)?, self.xs.iter());
        self.right_to_left
            .run(&params.view_direction(1)?, self.xs.iter().rev());

        let l2r = self.left_to_right.last(params.hidden);
        let r2l = self.right_to_left.last(params.hidden);
        self.cycle.forwarded();

        Ok(concatenate![Axis(0), l2r, r2l])
    }

    /// Propagates the errors of the last encoding, both to the parameters and the input.
    fn backward(&mut self, params: &BiRnnParams, errors: &Array1<f32>) -> Result<()> {
        self.cycle.check_forwarded(KIND, self.id)?;
        check_len(KIND, "output errors width", errors.len(), params.output())?;

        let size = BiRnnParams::direction_size(params.input, params.hidden);
        let mut grad = vec![0.; params.size()];
        let (l2r_grad, r2l_grad) = grad.split_at_mut(size);

        let l2r_dx = self.left_to_right.backward(
            &params.view_direction(0)?,
            &mut params.view_direction_grad(l2r_grad)?,
            self.xs.iter(),
            errors.slice(s![..params.hidden]),
        );
        let mut r2l_dx = self.right_to_left.backward(
            &params.view_direction(1)?,
            &mut params.view_direction_grad(r2l_grad)?,
            self.xs.iter().rev(),
            errors.slice(s![params.hidden..]),
        );
        r2l_dx.reverse();

        let input_errors = l2r_dx
            .into_iter()
            .zip(r2l_dx)
            .map(|(a, b)| a + b)
            .collect();

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

impl Recycle for BiRnn {
    fn cycle_mut(&mut self) -> &mut Cycle {
        &mut self.cycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    fn params() -> BiRnnParams {
        let mut rng = StdRng::seed_from_u64(3);
        BiRnnParams::new(2, 3, &Initializer::default(), &mut rng).unwrap()
    }

    fn loss(params: &BiRnnParams, xs: &[Array1<f32>]) -> f32 {
        BiRnn::new(0).forward(params, xs).unwrap().sum()
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut params = params();
        let xs = vec![
            Array1::from(vec![0.3, -0.2]),
            Array1::from(vec![0.1, 0.5]),
            Array1::from(vec![-0.4, 0.2]),
        ];

        let mut rnn = BiRnn::new(0);
        let y = rnn.forward(&params, &xs).unwrap();
        rnn.backward(&params, &Array1::ones(y.len())).unwrap();
        let grad = rnn.params_errors(false).unwrap();
        let dxs = rnn.input_errors(false).unwrap();

        let h = 1e-2;
        for i in [0, 7, 15, 20, 31, 35] {
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
        shifted[1][0] += h;
        let plus = loss(&params, &shifted);
        shifted[1][0] -= 2. * h;
        let minus = loss(&params, &shifted);
        let numeric = (plus - minus) / (2. * h);
        assert!((numeric - dxs[1][0]).abs() < 1e-2);
    }

    #[test]
    fn empty_sequences_encode_to_zeros() {
        let params = params();
        let mut rnn = BiRnn::new(0);

        let y = rnn.forward(&params, &[]).unwrap();
        assert_eq!(y, Array1::<f32>::zeros(6));

        rnn.backward(&params, &Array1::ones(6)).unwrap();
        assert!(rnn.input_errors(true).unwrap().is_empty());
    }
}
