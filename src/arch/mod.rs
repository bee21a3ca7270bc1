pub mod activations;
pub mod embeddings;
mod init;
pub mod layers;
pub(crate) mod module;

pub use embeddings::{EmbeddingsMap, KeyExtractor};
pub use init::Initializer;
pub use module::Module;
