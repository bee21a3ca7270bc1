pub mod arch;
pub mod config;
pub mod encoders;
pub mod error;
pub mod optimization;
pub mod pool;
pub mod sentence;

pub use error::{EncoderErr, Result};
