use log::{debug, trace};

use crate::{EncoderErr, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Idle,
    Forwarded,
    Backwarded,
}

/// Tracks the forward/backward cycle of a stateful item.
///
/// Every item handed out by an `ItemsPool` is stamped with the pool's current generation. The
/// transient state captured by `forward` is tagged with the generation it was produced in, so a
/// `backward` against a released item that was not forwarded again is reported as stale instead
/// of silently reading the previous cycle's buffers.
#[derive(Debug, Clone, Default)]
pub struct Cycle {
    issued: u64,
    state: u64,
    phase: Phase,
}

impl Cycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamps the item with the generation it is being issued in.
    pub(crate) fn issue(&mut self, generation: u64) {
        self.issued = generation;
    }

    /// Marks the transient state as freshly produced by a forward.
    pub fn forwarded(&mut self) {
        self.state = self.issued;
        self.phase = Phase::Forwarded;
    }

    /// Validates that a backward may run, leaving the cycle in the forwarded phase.
    ///
    /// # Arguments
    /// * `kind` - The kind of the item, used for error reporting.
    /// * `id` - The id of the item, used for error reporting.
    pub fn check_forwarded(&self, kind: &'static str, id: usize) -> Result<()> {
        self.check_current(kind, id)?;

        if self.phase != Phase::Forwarded {
            return Err(EncoderErr::BackwardBeforeForward { kind, id });
        }

        Ok(())
    }

    /// Moves the cycle into the backwarded phase, once a backward succeeded.
    pub fn backwarded(&mut self) {
        self.phase = Phase::Backwarded;
    }

    /// Validates that the errors of the last backward can be read.
    pub fn check_backwarded(&self, kind: &'static str, what: &'static str) -> Result<()> {
        if self.phase != Phase::Backwarded || self.state != self.issued {
            return Err(EncoderErr::ErrorsUnavailable { kind, what });
        }

        Ok(())
    }

    fn check_current(&self, kind: &'static str, id: usize) -> Result<()> {
        if self.phase != Phase::Idle && self.state != self.issued {
            return Err(EncoderErr::StaleState { kind, id });
        }

        Ok(())
    }
}

/// An item that can live in an `ItemsPool`.
pub trait Recycle {
    fn cycle_mut(&mut self) -> &mut Cycle;
}

/// A growable collection of reusable stateful items.
///
/// Item ids are dense and stable: the `i`-th item issued after a `release_all` is always the same
/// underlying instance, with id `i`. Releasing does not touch the items' buffers, the next
/// forward overwrites them.
#[derive(Debug)]
pub struct ItemsPool<T> {
    items: Vec<T>,
    issued: usize,
    generation: u64,
}

impl<T> Default for ItemsPool<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            issued: 0,
            generation: 0,
        }
    }
}

impl<T: Recycle> ItemsPool<T> {
    /// Creates a new empty `ItemsPool`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an available item, building a new one if every item is issued.
    ///
    /// # Arguments
    /// * `build` - The factory of a new item given its id.
    ///
    /// # Returns
    /// The id of the item and a mutable reference to it, or the error of the factory.
    pub fn get_item<F>(&mut self, build: F) -> Result<(usize, &mut T)>
    where
        F: FnOnce(usize) -> Result<T>,
    {
        let id = self.issued;

        if id == self.items.len() {
            debug!(id = id; "growing pool");
            self.items.push(build(id)?);
        }

        self.issued += 1;
        let item = &mut self.items[id];
        item.cycle_mut().issue(self.generation);

        Ok((id, item))
    }

    /// Marks every issued item as available again, starting a new generation.
    pub fn release_all(&mut self) {
        trace!(issued = self.issued, generation = self.generation; "releasing pool items");
        self.issued = 0;
        self.generation += 1;
    }

    /// Releases all the items and acquires exactly `n` of them.
    ///
    /// # Arguments
    /// * `n` - The amount of items to acquire.
    /// * `build` - The factory of the missing items given their id.
    ///
    /// # Returns
    /// The `n` acquired items, ordered by id.
    pub fn get_items<F>(&mut self, n: usize, mut build: F) -> Result<&mut [T]>
    where
        F: FnMut(usize) -> Result<T>,
    {
        self.release_all();

        for _ in 0..n {
            self.get_item(&mut build)?;
        }

        Ok(&mut self.items[..n])
    }

    /// Returns an issued item given its id.
    pub fn item_mut(&mut self, id: usize) -> Option<&mut T> {
        self.items[..self.issued].get_mut(id)
    }

    /// Returns the items issued in the current generation, ordered by id.
    pub fn issued_mut(&mut self) -> &mut [T] {
        &mut self.items[..self.issued]
    }

    /// Drops the items beyond the first `n`.
    ///
    /// # Returns
    /// An error if any of the dropped items is still issued.
    pub fn shrink_to(&mut self, n: usize) -> Result<()> {
        if n < self.issued {
            return Err(EncoderErr::PoolShrinkBelowIssued {
                issued: self.issued,
                requested: n,
            });
        }

        self.items.truncate(n);
        Ok(())
    }

    /// The amount of items the pool owns.
    pub fn size(&self) -> usize {
        self.items.len()
    }

    /// The amount of items issued in the current generation.
    pub fn issued(&self) -> usize {
        self.issued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Item {
        id: usize,
        cycle: Cycle,
    }

    impl Recycle for Item {
        fn cycle_mut(&mut self) -> &mut Cycle {
            &mut self.cycle
        }
    }

    fn backward(cycle: &mut Cycle, id: usize) -> Result<()> {
        cycle.check_forwarded("item", id)?;
        cycle.backwarded();
        Ok(())
    }

    fn build(id: usize) -> Result<Item> {
        Ok(Item {
            id,
            cycle: Cycle::new(),
        })
    }

    #[test]
    fn ids_are_dense_and_reused_after_release() {
        let mut pool = ItemsPool::new();

        let first: Vec<_> = pool.get_items(3, build).unwrap().iter().map(|i| i.id).collect();
        pool.release_all();
        let second: Vec<_> = pool.get_items(3, build).unwrap().iter().map(|i| i.id).collect();

        assert_eq!(first, [0, 1, 2]);
        assert_eq!(first, second);
        assert_eq!(pool.size(), 3);
    }

    #[test]
    fn pool_grows_only_when_every_item_is_issued() {
        let mut pool = ItemsPool::new();

        pool.get_items(2, build).unwrap();
        pool.get_items(1, build).unwrap();
        assert_eq!(pool.size(), 2);

        let (id, _) = pool.get_item(build).unwrap();
        assert_eq!(id, 1);
        let (id, _) = pool.get_item(build).unwrap();
        assert_eq!(id, 2);
        assert_eq!(pool.size(), 3);
    }

    #[test]
    fn stale_items_cannot_be_backwarded() {
        let mut pool = ItemsPool::new();

        let (_, item) = pool.get_item(build).unwrap();
        item.cycle.forwarded();
        backward(&mut item.cycle, 0).unwrap();

        pool.release_all();
        let (id, item) = pool.get_item(build).unwrap();
        assert!(matches!(
            backward(&mut item.cycle, id),
            Err(EncoderErr::StaleState { .. })
        ));

        item.cycle.forwarded();
        assert!(backward(&mut item.cycle, id).is_ok());
    }

    #[test]
    fn backward_requires_exactly_one_forward() {
        let mut cycle = Cycle::new();

        assert!(matches!(
            backward(&mut cycle, 0),
            Err(EncoderErr::BackwardBeforeForward { .. })
        ));

        cycle.forwarded();
        assert!(cycle.check_forwarded("item", 0).is_ok());
        assert!(cycle.check_backwarded("item", "params errors").is_err());
        backward(&mut cycle, 0).unwrap();
        assert!(cycle.check_backwarded("item", "params errors").is_ok());
        assert!(matches!(
            backward(&mut cycle, 0),
            Err(EncoderErr::BackwardBeforeForward { .. })
        ));
    }

    #[test]
    fn shrinking_below_issued_items_fails() {
        let mut pool = ItemsPool::new();
        pool.get_items(3, build).unwrap();

        assert!(matches!(
            pool.shrink_to(2),
            Err(EncoderErr::PoolShrinkBelowIssued { issued: 3, requested: 2 })
        ));

        pool.release_all();
        pool.shrink_to(1).unwrap();
        assert_eq!(pool.size(), 1);
    }
}
