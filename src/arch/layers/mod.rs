mod attention;
mod birnn;
mod dense;
mod reducer;
mod self_attention;

pub use attention::{Attention, AttentionParams};
pub use birnn::{BiRnn, BiRnnParams};
pub use dense::{Dense, DenseParams};
pub use reducer::{ReducerParams, SequenceReducer};
pub use self_attention::{SelfAttention, SelfAttentionParams};
