use std::{collections::HashMap, hash::Hash};

use crate::{EncoderErr, Result, error::check_len};

/// How the contributions to the same parameter owner are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Sum,
    Mean,
}

#[derive(Debug, Clone)]
struct Entry {
    sum: Vec<f32>,
    count: usize,
}

/// Collects the gradient contributions a set of parameter owners receives during one backward.
///
/// Entries are kept in the order their owner first contributed.
#[derive(Debug, Clone)]
pub struct GradientAccumulator<K> {
    entries: Option<Vec<(K, Entry)>>,
    index: HashMap<K, usize>,
}

impl<K> Default for GradientAccumulator<K> {
    fn default() -> Self {
        Self {
            entries: None,
            index: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> GradientAccumulator<K> {
    /// Creates a new `GradientAccumulator` with nothing accumulated.
    pub fn new() -> Self {
        Self::default()
    }

    /// Discards every contribution, to be called at the start of every backward.
    pub fn reset(&mut self) {
        self.index.clear();
        self.entries = Some(Vec::new());
    }

    /// Adds the contribution of `owner`.
    ///
    /// # Returns
    /// An error if `values` doesn't match the width of the previous contributions of `owner`.
    pub fn accumulate(&mut self, owner: K, values: &[f32]) -> Result<()> {
        let entries = self.entries.get_or_insert_with(Vec::new);

        match self.index.get(&owner) {
            Some(&i) => {
                let entry = &mut entries[i].1;
                check_len("accumulator", "contribution", values.len(), entry.sum.len())?;
                entry.sum.iter_mut().zip(values).for_each(|(s, v)| *s += v);
                entry.count += 1;
            }
            None => {
                self.index.insert(owner.clone(), entries.len());
                let entry = Entry {
                    sum: values.to_vec(),
                    count: 1,
                };
                entries.push((owner, entry));
            }
        }

        Ok(())
    }

    /// The amount of owners that contributed since the last reset.
    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the accumulated errors of every owner.
    ///
    /// # Arguments
    /// * `reduction` - Whether to sum the contributions or average them per owner.
    /// * `copy` - Whether to keep the accumulated values; otherwise they are handed over and the
    ///   accumulator must be reset before it can be queried again.
    ///
    /// # Returns
    /// The errors of each owner in first contribution order, or `AccumulatorEmpty` if the
    /// accumulator was neither reset nor accumulated into.
    pub fn params_errors(&mut self, reduction: Reduction, copy: bool) -> Result<Vec<(K, Vec<f32>)>> {
        let entries = if copy {
            self.entries.clone()
        } else {
            self.index.clear();
            self.entries.take()
        };

        let entries = entries.ok_or(EncoderErr::AccumulatorEmpty)?;

        Ok(entries
            .into_iter()
            .map(|(owner, Entry { mut sum, count })| {
                if reduction == Reduction::Mean && count > 1 {
                    let n = count as f32;
                    sum.iter_mut().for_each(|s| *s /= n);
                }
                (owner, sum)
            })
            .collect())
    }
}
