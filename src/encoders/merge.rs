use ndarray::{Array1, ArrayView1, Axis, concatenate, s};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    EncoderErr, Result,
    arch::{
        Initializer, Module,
        activations::ActFn,
        layers::{Dense, DenseParams},
    },
    error::check_len,
};

const KIND: &str = "merge";

/// How the outputs of the branches of an ensemble are combined into one vector per token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeModel {
    /// Positional concatenation of the branch outputs.
    Concat,
    /// A dense layer taking every branch output as a separate input.
    Affine(DenseParams),
    /// A dense layer applied to the concatenation of the branch outputs.
    ConcatFeedforward(DenseParams),
    /// Element-wise sum of equally wide branch outputs.
    Sum,
    /// Element-wise average of equally wide branch outputs.
    Avg,
    /// Element-wise product of equally wide branch outputs.
    Product,
}

impl MergeModel {
    /// Creates an affine merge of branches of the given widths.
    pub fn affine<R: Rng>(
        widths: &[usize],
        output: usize,
        act_fn: Option<ActFn>,
        init: &Initializer,
        rng: &mut R,
    ) -> Result<Self> {
        DenseParams::new(widths.to_vec(), output, act_fn, init, rng).map(MergeModel::Affine)
    }

    /// Creates a feed-forward merge over the concatenation of branches of the given widths.
    pub fn concat_feedforward<R: Rng>(
        widths: &[usize],
        output: usize,
        act_fn: Option<ActFn>,
        init: &Initializer,
        rng: &mut R,
    ) -> Result<Self> {
        let input = widths.iter().sum();
        DenseParams::linear(input, output, act_fn, init, rng).map(MergeModel::ConcatFeedforward)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MergeModel::Concat => "concat",
            MergeModel::Affine(_) => "affine",
            MergeModel::ConcatFeedforward(_) => "concat feedforward",
            MergeModel::Sum => "sum",
            MergeModel::Avg => "avg",
            MergeModel::Product => "product",
        }
    }

    /// Checks that the merge accepts branches of the given widths.
    pub fn validate(&self, widths: &[usize]) -> Result<()> {
        if widths.is_empty() {
            return Err(EncoderErr::EmptyEnsemble);
        }

        if widths.contains(&0) {
            return Err(EncoderErr::ZeroWidth {
                kind: self.kind(),
                what: "branch output",
            });
        }

        match self {
            MergeModel::Concat => Ok(()),
            MergeModel::Affine(dense) => {
                dense.validate()?;
                check_len(self.kind(), "branches", dense.inputs().len(), widths.len())?;

                for (&got, &expected) in widths.iter().zip(dense.inputs()) {
                    check_width(self.kind(), got, expected)?;
                }

                Ok(())
            }
            MergeModel::ConcatFeedforward(dense) => {
                dense.validate()?;
                check_width(self.kind(), widths.iter().sum(), dense.input_size())
            }
            MergeModel::Sum | MergeModel::Avg | MergeModel::Product => widths
                .iter()
                .try_for_each(|&got| check_width(self.kind(), got, widths[0])),
        }
    }

    /// The width of the merged vectors, given the widths of the branches.
    pub fn output_size(&self, widths: &[usize]) -> usize {
        match self {
            MergeModel::Concat => widths.iter().sum(),
            MergeModel::Affine(dense) | MergeModel::ConcatFeedforward(dense) => dense.output(),
            MergeModel::Sum | MergeModel::Avg | MergeModel::Product => {
                widths.first().copied().unwrap_or(0)
            }
        }
    }

    /// The parameters of the merge, if it has any.
    pub fn params(&self) -> Option<&DenseParams> {
        match self {
            MergeModel::Affine(dense) | MergeModel::ConcatFeedforward(dense) => Some(dense),
            _ => None,
        }
    }

    pub fn params_mut(&mut self) -> Option<&mut DenseParams> {
        match self {
            MergeModel::Affine(dense) | MergeModel::ConcatFeedforward(dense) => Some(dense),
            _ => None,
        }
    }
}

fn check_width(kind: &'static str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(EncoderErr::WidthMismatch {
            kind,
            what: "branch output",
            got,
            expected,
        });
    }

    Ok(())
}

/// The transient state of a merge over one sentence.
///
/// Branch outputs come in branch-major order, `outputs[branch][token]`, and the errors routed
/// back to the branches keep that order.
#[derive(Debug)]
pub(super) struct MergeLayer {
    dense: Option<Dense>,
    widths: Vec<usize>,
    outputs: Vec<Vec<Array1<f32>>>,
}

impl MergeLayer {
    /// Creates a new `MergeLayer`.
    ///
    /// # Arguments
    /// * `id` - The id of the owning encoder.
    /// * `model` - The merge model.
    /// * `propagate` - Whether the errors must be routed back to the branches.
    pub fn new(id: usize, model: &MergeModel, propagate: bool) -> Self {
        Self {
            dense: model.params().map(|_| Dense::new(id, propagate)),
            widths: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn forward(
        &mut self,
        model: &MergeModel,
        outputs: Vec<Vec<Array1<f32>>>,
    ) -> Result<Vec<Array1<f32>>> {
        let tokens = outputs.first().map_or(0, Vec::len);
        for branch in &outputs {
            check_len(KIND, "branch outputs", branch.len(), tokens)?;
        }

        self.widths = outputs
            .iter()
            .map(|branch| branch.first().map_or(0, Array1::len))
            .collect();

        let merged = match (model, &mut self.dense) {
            (MergeModel::Concat, _) => concat_tokens(&outputs, tokens)?,
            (MergeModel::Affine(params), Some(dense)) => {
                let input: Vec<Vec<_>> = (0..tokens)
                    .map(|t| outputs.iter().map(|branch| branch[t].clone()).collect())
                    .collect();
                dense.forward(params, &input)?
            }
            (MergeModel::ConcatFeedforward(params), Some(dense)) => {
                dense.forward_single(params, &concat_tokens(&outputs, tokens)?)?
            }
            (MergeModel::Sum | MergeModel::Avg | MergeModel::Product, _) => {
                let mut merged = Vec::with_capacity(tokens);

                for t in 0..tokens {
                    let mut y = outputs[0][t].clone();
                    for branch in &outputs[1..] {
                        check_len(model.kind(), "branch output width", branch[t].len(), y.len())?;
                        match model {
                            MergeModel::Product => y *= &branch[t],
                            _ => y += &branch[t],
                        }
                    }

                    if let MergeModel::Avg = model {
                        y /= outputs.len() as f32;
                    }

                    merged.push(y);
                }

                merged
            }
            (_, None) => {
                return Err(EncoderErr::ModelMismatch {
                    expected: "merge without parameters",
                    got: model.kind(),
                });
            }
        };

        self.outputs = match model {
            MergeModel::Product => outputs,
            _ => Vec::new(),
        };

        Ok(merged)
    }

    /// Backpropagates the merged errors.
    ///
    /// # Returns
    /// The errors of every branch output, `None` if the merge doesn't propagate them.
    pub fn backward(
        &mut self,
        model: &MergeModel,
        errors: &[Array1<f32>],
    ) -> Result<Option<Vec<Vec<Array1<f32>>>>> {
        let k = self.widths.len();

        let branch_errors = match (model, &mut self.dense) {
            (MergeModel::Concat, _) => split_tokens(errors, &self.widths)?,
            (MergeModel::Affine(params), Some(dense)) => {
                dense.backward(params, errors)?;
                if !dense.propagate_to_input() {
                    return Ok(None);
                }

                let mut branch_errors = vec![Vec::with_capacity(errors.len()); k];
                for token_errors in dense.input_errors(false)? {
                    for (branch, e) in branch_errors.iter_mut().zip(token_errors) {
                        branch.push(e);
                    }
                }

                branch_errors
            }
            (MergeModel::ConcatFeedforward(params), Some(dense)) => {
                dense.backward(params, errors)?;
                if !dense.propagate_to_input() {
                    return Ok(None);
                }

                split_tokens(&dense.single_input_errors(false)?, &self.widths)?
            }
            (MergeModel::Sum, _) => vec![errors.to_vec(); k],
            (MergeModel::Avg, _) => {
                let scaled: Vec<_> = errors.iter().map(|e| e / k as f32).collect();
                vec![scaled; k]
            }
            (MergeModel::Product, _) => (0..k)
                .map(|i| {
                    errors
                        .iter()
                        .enumerate()
                        .map(|(t, e)| {
                            let mut d = e.clone();
                            for (j, branch) in self.outputs.iter().enumerate() {
                                if j != i {
                                    d *= &branch[t];
                                }
                            }
                            d
                        })
                        .collect()
                })
                .collect(),
            (_, None) => {
                return Err(EncoderErr::ModelMismatch {
                    expected: "merge without parameters",
                    got: model.kind(),
                });
            }
        };

        Ok(Some(branch_errors))
    }

    /// The errors of the merge parameters, `None` for merges without parameters.
    pub fn params_errors(&mut self, copy: bool) -> Result<Option<Vec<f32>>> {
        self.dense
            .as_mut()
            .map(|dense| dense.params_errors(copy))
            .transpose()
    }
}

/// Concatenates the branch outputs of every token.
fn concat_tokens(outputs: &[Vec<Array1<f32>>], tokens: usize) -> Result<Vec<Array1<f32>>> {
    (0..tokens)
        .map(|t| {
            let views: Vec<ArrayView1<f32>> = outputs.iter().map(|branch| branch[t].view()).collect();
            Ok(concatenate(Axis(0), &views)?)
        })
        .collect()
}

/// Splits every token vector into contiguous slices of the given widths, in branch-major order.
fn split_tokens(errors: &[Array1<f32>], widths: &[usize]) -> Result<Vec<Vec<Array1<f32>>>> {
    let total = widths.iter().sum();
    let mut branches = vec![Vec::with_capacity(errors.len()); widths.len()];

    for e in errors {
        check_len(KIND, "merged errors width", e.len(), total)?;

        let mut start = 0;
        for (branch, &width) in branches.iter_mut().zip(widths) {
            branch.push(e.slice(s![start..start + width]).to_owned());
            start += width;
        }
    }

    Ok(branches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::{SeedableRng, rngs::StdRng};

    fn branch_outputs() -> Vec<Vec<Array1<f32>>> {
        vec![
            vec![array![1., 2.], array![3., 4.]],
            vec![array![0.5, -1.], array![2., 0.]],
        ]
    }

    #[test]
    fn order_independent_merges_require_equal_widths() {
        assert!(MergeModel::Sum.validate(&[3, 3, 3]).is_ok());
        assert!(matches!(
            MergeModel::Product.validate(&[3, 4]),
            Err(EncoderErr::WidthMismatch { got: 4, expected: 3, .. })
        ));
        assert!(matches!(MergeModel::Concat.validate(&[]), Err(EncoderErr::EmptyEnsemble)));
        assert!(matches!(
            MergeModel::Concat.validate(&[2, 0]),
            Err(EncoderErr::ZeroWidth { .. })
        ));
    }

    #[test]
    fn affine_merges_check_every_input_width() {
        let mut rng = StdRng::seed_from_u64(0);
        let merge = MergeModel::affine(&[2, 3], 4, None, &Initializer::default(), &mut rng).unwrap();

        assert!(merge.validate(&[2, 3]).is_ok());
        assert!(merge.validate(&[3, 2]).is_err());
        assert!(merge.validate(&[2]).is_err());
        assert_eq!(merge.output_size(&[2, 3]), 4);
    }

    #[test]
    fn sum_and_avg_fan_errors_out() {
        let errors = [array![1., 2.], array![4., 6.]];

        let mut sum = MergeLayer::new(0, &MergeModel::Sum, true);
        let y = sum.forward(&MergeModel::Sum, branch_outputs()).unwrap();
        assert_eq!(y, [array![1.5f32, 1.], array![5., 4.]]);
        let e = sum.backward(&MergeModel::Sum, &errors).unwrap().unwrap();
        assert_eq!(e, [errors.to_vec(), errors.to_vec()]);

        let mut avg = MergeLayer::new(0, &MergeModel::Avg, true);
        let y = avg.forward(&MergeModel::Avg, branch_outputs()).unwrap();
        assert_eq!(y, [array![0.75f32, 0.5], array![2.5, 2.]]);
        let e = avg.backward(&MergeModel::Avg, &errors).unwrap().unwrap();
        assert_eq!(e[1], [array![0.5f32, 1.], array![2., 3.]]);
    }

    #[test]
    fn product_errors_use_the_other_branches() {
        let mut product = MergeLayer::new(0, &MergeModel::Product, true);
        let y = product.forward(&MergeModel::Product, branch_outputs()).unwrap();
        assert_eq!(y, [array![0.5f32, -2.], array![6., 0.]]);

        let e = product
            .backward(&MergeModel::Product, &[array![1., 1.], array![1., 1.]])
            .unwrap()
            .unwrap();
        assert_eq!(e[0], [array![0.5f32, -1.], array![2., 0.]]);
        assert_eq!(e[1], [array![1f32, 2.], array![3., 4.]]);
    }

    #[test]
    fn affine_merges_route_each_input_errors_to_its_branch() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut model = MergeModel::affine(&[2, 1], 1, None, &Initializer::default(), &mut rng)
            .unwrap();
        // W_1 = [[1], [2]], W_2 = [[3]], b = [0.5]
        if let Some(dense) = model.params_mut() {
            dense.values_mut().copy_from_slice(&[1., 2., 3., 0.5]);
        }

        let outputs = vec![
            vec![array![1., 2.], array![0., 1.]],
            vec![array![2.], array![-1.]],
        ];

        let mut layer = MergeLayer::new(0, &model, true);
        let y = layer.forward(&model, outputs).unwrap();
        assert_eq!(y, [array![11.5f32], array![-0.5]]);

        let e = layer.backward(&model, &[array![1.], array![2.]]).unwrap().unwrap();
        assert_eq!(e[0], [array![1f32, 2.], array![2., 4.]]);
        assert_eq!(e[1], [array![3f32], array![6.]]);

        // dW_1 = [1, 2] + 2 * [0, 1], dW_2 = 2 - 2, db = 1 + 2
        assert_eq!(layer.params_errors(false).unwrap(), Some(vec![1., 4., 0., 3.]));
    }

    #[test]
    fn frozen_affine_merges_route_nothing() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = MergeModel::affine(&[2, 2], 2, None, &Initializer::default(), &mut rng)
            .unwrap();

        let mut layer = MergeLayer::new(0, &model, false);
        layer.forward(&model, branch_outputs()).unwrap();
        let e = layer
            .backward(&model, &[array![1., 1.], array![1., 1.]])
            .unwrap();

        assert!(e.is_none());
        assert_eq!(layer.params_errors(false).unwrap().map(|g| g.len()), Some(10));
    }

    #[test]
    fn feedforward_merges_split_the_concatenated_errors() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut model =
            MergeModel::concat_feedforward(&[2, 2], 1, None, &Initializer::default(), &mut rng)
                .unwrap();
        if let Some(dense) = model.params_mut() {
            dense.values_mut().copy_from_slice(&[1., 2., 3., 4., 0.]);
        }

        let mut layer = MergeLayer::new(0, &model, true);
        let y = layer.forward(&model, branch_outputs()).unwrap();
        // [1, 2, 0.5, -1] · [1, 2, 3, 4]
        assert_eq!(y[0], array![2.5f32]);

        let e = layer.backward(&model, &[array![1.], array![2.]]).unwrap().unwrap();
        assert_eq!(e[0], [array![1f32, 2.], array![2., 4.]]);
        assert_eq!(e[1], [array![3f32, 4.], array![6., 8.]]);
        assert_eq!(layer.params_errors(true).unwrap().map(|g| g.len()), Some(5));
    }
}
