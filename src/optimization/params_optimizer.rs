use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
};

use log::trace;

use super::{UpdateMethod, UpdateRule};
use crate::{EncoderErr, Result, arch::EmbeddingsMap, error::check_len};

/// Accumulates the gradients of one flat parameter block and steps it with an update rule.
#[derive(Debug)]
pub struct BlockOptimizer {
    rule: Box<dyn UpdateRule>,
    grad: Vec<f32>,
    pending: usize,
}

impl BlockOptimizer {
    /// Creates a new `BlockOptimizer` for a block of `len` parameters.
    pub fn new(method: &UpdateMethod, len: usize) -> Self {
        Self {
            rule: method.build(len),
            grad: vec![0.; len],
            pending: 0,
        }
    }

    /// Sums `grad` into the accumulated gradient.
    pub fn accumulate(&mut self, grad: &[f32]) -> Result<()> {
        check_len("block optimizer", "gradient", grad.len(), self.grad.len())?;
        self.grad.iter_mut().zip(grad).for_each(|(a, g)| *a += g);
        self.pending += 1;
        Ok(())
    }

    /// Applies one step of the update rule if anything was accumulated, then clears the
    /// accumulated gradient.
    pub fn update(&mut self, params: &mut [f32]) -> Result<()> {
        if self.pending == 0 {
            return Ok(());
        }

        trace!(contributions = self.pending; "updating parameter block");
        self.rule.update_params(&self.grad, params)?;
        self.grad.fill(0.);
        self.pending = 0;
        Ok(())
    }

    /// The amount of contributions accumulated since the last update.
    pub fn pending(&self) -> usize {
        self.pending
    }
}

/// Accumulates the gradients of the touched rows of an embeddings table.
///
/// Every row gets its own update rule, built the first time the row is touched.
#[derive(Debug)]
pub struct RowsOptimizer {
    method: UpdateMethod,
    width: usize,
    rules: HashMap<usize, Box<dyn UpdateRule>>,
    grads: BTreeMap<usize, Vec<f32>>,
}

impl RowsOptimizer {
    pub fn new(method: &UpdateMethod, width: usize) -> Self {
        Self {
            method: *method,
            width,
            rules: HashMap::new(),
            grads: BTreeMap::new(),
        }
    }

    /// Sums the gradient of every given row into the accumulated ones.
    pub fn accumulate(&mut self, rows: &[(usize, Vec<f32>)]) -> Result<()> {
        for (row, grad) in rows {
            check_len("rows optimizer", "row gradient", grad.len(), self.width)?;

            let acc = self
                .grads
                .entry(*row)
                .or_insert_with(|| vec![0.; self.width]);
            acc.iter_mut().zip(grad).for_each(|(a, g)| *a += g);
        }

        Ok(())
    }

    /// Steps every touched row of `table`, then clears the accumulated gradients.
    pub fn update<K>(&mut self, table: &mut EmbeddingsMap<K>) -> Result<()>
    where
        K: Eq + Hash + Clone,
    {
        check_len("rows optimizer", "row width", table.width(), self.width)?;
        if !self.grads.is_empty() {
            trace!(rows = self.grads.len(); "updating embedding rows");
        }

        for (row, grad) in std::mem::take(&mut self.grads) {
            if row >= table.rows() {
                return Err(EncoderErr::LengthMismatch {
                    kind: "rows optimizer",
                    what: "table rows",
                    got: table.rows(),
                    expected: row + 1,
                });
            }

            let rule = self
                .rules
                .entry(row)
                .or_insert_with(|| self.method.build(self.width));
            rule.update_params(&grad, table.row_mut(row))?;
        }

        Ok(())
    }

    /// The amount of rows touched since the last update.
    pub fn pending(&self) -> usize {
        self.grads.len()
    }
}
