//! Operator parameter records.
//!
//! One record per operator family. Each record is the complete input of a
//! single backend invocation: borrowed input buffers, borrowed weights, scalar
//! configuration and `&mut` borrows of caller-preallocated outputs. Records
//! are built per call and never persisted.
//!
//! Backend-agnostic shape validation lives here as `validate` methods so
//! every backend rejects malformed calls identically.

pub mod attention;
pub mod collective;
pub mod copy;
pub mod ffn;
pub mod gemm;
pub mod norm;
pub mod sampler;

pub use attention::{
    AttentionCommonInputs, AttentionConfigs, AttentionLayerParams, AttentionModuleParams,
};
pub use collective::{AllReduceParams, BroadcastParams};
pub use copy::{CopyParams, CopyRegion};
pub use ffn::{ActivationType, FfnLayerParams};
pub use gemm::{GemmDims, GemmParams, GroupedGemmParams, TransposeOperation};
pub use norm::{LayerNormOpType, LayerNormType, LayernormParams};
pub use sampler::{SamplerParams, SamplingKnobs, TopKSamplerParams, TopPSamplerParams};
