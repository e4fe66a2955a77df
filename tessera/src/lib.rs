//! Tessera: operator contracts and tensor-parallel attention for transformer
//! inference.
//!
//! This crate provides the backend-agnostic core: the buffer trait, the
//! status/error model, the weights tree, one parameter record per operator
//! family, the op traits a backend implements, and the tensor-parallel
//! attention layer composed from them. Backend implementations live in
//! separate crates.

pub mod attention_layer;
#[allow(clippy::missing_errors_doc)]
pub mod backend;
pub mod comm;
pub mod dtype;
pub mod error;
pub mod lora;
pub mod params;
pub mod rope;
pub mod shard;
pub mod tensor;
pub mod weights;

pub use attention_layer::{AttentionLayerConfig, TensorParallelAttentionLayer};
pub use backend::{
    AttentionOps, Backend, BufferOps, FfnOps, GemmOps, NormOps, OpProvider, SamplerOps,
    TensorDataOps,
};
pub use comm::{Communicator, CustomAllReduce, CustomAllReduceConfig, SingleRank};
pub use dtype::{DType, TensorDType};
pub use error::{OpError, OpErrorType, OpStatus, Result};
pub use rope::PositionEmbeddingStyle;
pub use shard::{shard_strategy_for_weight, ShardConfig, ShardStrategy};
pub use tensor::Tensor;
pub use weights::{
    AttentionLayerWeights, DenseWeights, FfnLayerWeights, LayerNormWeights, LayerWeights,
    LoraWeights, LoraWeightsMap, Weights,
};
