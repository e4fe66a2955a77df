//! Backend trait and op trait definitions.
//!
//! Composite layers are generic over `B: Backend` and use op traits like
//! `GemmOps`, `NormOps`, etc. to express their compute requirements. Each
//! backend implements these traits on a marker type with its own tensor type.
//!
//! # Design notes
//!
//! - **Op traits extend `Backend`** and use `Self::Tensor` from the
//!   supertrait.
//! - **Every entry point takes one parameter record** from
//!   [`crate::params`] and returns `Result<()>`. Outputs live in the record
//!   as `&mut` borrows of caller-allocated buffers.
//! - **Validation is shared.** Implementations call the record's `validate`
//!   first so every backend rejects malformed calls identically.

use crate::dtype::DType;
use crate::params::{
    AttentionModuleParams, CopyParams, FfnLayerParams, GemmParams, GroupedGemmParams,
    LayernormParams, TopKSamplerParams, TopPSamplerParams,
};
use crate::tensor::Tensor;
use crate::Result;

// ---- Core backend trait ----

/// A compute backend (accelerator, CPU reference, ...).
pub trait Backend: 'static {
    /// The buffer type for this backend.
    type Tensor: Tensor + Clone + Send + Sync + 'static;
}

// ---- Op traits ----

/// Buffer acquisition and element-wise copy.
pub trait BufferOps: Backend {
    /// Allocate a zero-filled buffer.
    ///
    /// Fails with `ResourceExhausted` when the memory cannot be acquired.
    fn allocate(shape: &[usize], dtype: DType) -> Result<Self::Tensor>;

    /// `dst <- src`, whole buffer or a region.
    fn copy(params: CopyParams<'_, Self::Tensor>) -> Result<()>;
}

/// Host transfers for the small metadata buffers composite layers inspect
/// (request lengths, adapter ids).
pub trait TensorDataOps: Backend {
    /// Upload host values, cast into `dtype`.
    fn from_f32_slice(shape: &[usize], dtype: DType, data: &[f32]) -> Result<Self::Tensor>;

    /// Download any float or integer buffer as f32.
    fn to_f32_vec(tensor: &Self::Tensor) -> Result<Vec<f32>>;

    /// Download an I32/U32 buffer.
    fn to_index_vec(tensor: &Self::Tensor) -> Result<Vec<i64>>;
}

/// Dense, quantized and grouped matrix multiplication.
pub trait GemmOps: Backend {
    /// `D = alpha * op(A) * op(B) + beta * C`
    fn gemm(params: GemmParams<'_, Self::Tensor>) -> Result<()>;

    /// Independent GEMMs over parallel operand sequences.
    ///
    /// The default issues one [`gemm`](Self::gemm) per group in order.
    fn grouped_gemm(params: GroupedGemmParams<'_, Self::Tensor>) -> Result<()> {
        for group in params.into_groups()? {
            Self::gemm(group)?;
        }
        Ok(())
    }
}

/// Normalization variants with fused bias and residual handling.
pub trait NormOps: Backend {
    fn layernorm(params: LayernormParams<'_, Self::Tensor>) -> Result<()>;
}

/// Core attention over a fused QKV buffer and the key/value cache.
pub trait AttentionOps: Backend {
    fn attention_module(params: AttentionModuleParams<'_, '_, Self::Tensor>) -> Result<()>;
}

/// Feed-forward block.
pub trait FfnOps: Backend {
    fn ffn_layer(params: FfnLayerParams<'_, Self::Tensor>) -> Result<()>;
}

/// Stochastic token selection.
pub trait SamplerOps: Backend {
    fn sample_top_p(params: TopPSamplerParams<'_, Self::Tensor>) -> Result<()>;

    fn sample_top_k(params: TopKSamplerParams<'_, Self::Tensor>) -> Result<()>;
}

/// The full operator set. Implemented automatically for every backend that
/// implements each family.
pub trait OpProvider:
    BufferOps + TensorDataOps + GemmOps + NormOps + AttentionOps + FfnOps + SamplerOps
{
}

impl<B> OpProvider for B where
    B: BufferOps + TensorDataOps + GemmOps + NormOps + AttentionOps + FfnOps + SamplerOps
{
}
