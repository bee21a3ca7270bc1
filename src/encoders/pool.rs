use super::{Encoder, EncoderModel, EncoderOptions};
use crate::{EncoderErr, Result, pool::ItemsPool};

/// A pool of encoders all built from the same model.
///
/// The model itself isn't owned: the same one is passed to every acquisition and to every
/// forward and backward of the acquired encoders. The kind and encoding size of the first model
/// are kept, acquiring with another model fails until the pool is shrunk to zero.
#[derive(Debug)]
pub struct EncodersPool {
    pool: ItemsPool<Encoder>,
    options: EncoderOptions,
    fingerprint: Option<(&'static str, usize)>,
}

impl EncodersPool {
    /// Creates a new empty `EncodersPool`.
    ///
    /// # Arguments
    /// * `options` - The options every encoder of the pool is built with.
    pub fn new(options: EncoderOptions) -> Self {
        Self {
            pool: ItemsPool::new(),
            options,
            fingerprint: None,
        }
    }

    /// Checks that `model` looks like the one the pool encoders were built from.
    fn check_model(&mut self, model: &EncoderModel) -> Result<()> {
        let (kind, size) = (model.kind(), model.encoding_size());

        match self.fingerprint {
            Some((expected, _)) if expected != kind => Err(EncoderErr::ModelMismatch {
                expected,
                got: kind,
            }),
            Some((_, expected)) if expected != size => Err(EncoderErr::WidthMismatch {
                kind: "encoders pool",
                what: "encoding size",
                got: size,
                expected,
            }),
            Some(_) => Ok(()),
            None => {
                self.fingerprint = Some((kind, size));
                Ok(())
            }
        }
    }

    /// Returns an available encoder, building a new one from `model` if every one is issued.
    pub fn get_item(&mut self, model: &EncoderModel) -> Result<(usize, &mut Encoder)> {
        self.check_model(model)?;
        let options = self.options;
        self.pool
            .get_item(|id| model.build_encoder(id, options))
    }

    /// Releases every encoder and acquires exactly `n` of them, ordered by id.
    pub fn get_encoders(&mut self, model: &EncoderModel, n: usize) -> Result<&mut [Encoder]> {
        self.check_model(model)?;
        let options = self.options;
        self.pool
            .get_items(n, |id| model.build_encoder(id, options))
    }

    /// Returns an issued encoder given its id.
    pub fn item_mut(&mut self, id: usize) -> Option<&mut Encoder> {
        self.pool.item_mut(id)
    }

    /// Marks every encoder as available again. Their state is stale until they are forwarded.
    pub fn release_all(&mut self) {
        self.pool.release_all();
    }

    /// Drops the encoders beyond the first `n`, failing if any of them is issued.
    ///
    /// Shrinking to zero lets the pool be used with another model.
    pub fn shrink_to(&mut self, n: usize) -> Result<()> {
        self.pool.shrink_to(n)?;
        if n == 0 {
            self.fingerprint = None;
        }

        Ok(())
    }

    pub fn size(&self) -> usize {
        self.pool.size()
    }

    pub fn issued(&self) -> usize {
        self.pool.issued()
    }
}
