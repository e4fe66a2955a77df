//! CPU implementations of all backend op traits.

pub mod activation;
pub mod attention;
pub mod buffer;
pub mod ffn;
pub mod gemm;
pub mod norm;
pub mod sample;

use tessera::tensor::Tensor;
use tessera::{OpError, Result};

use crate::tensor::CpuTensor;

/// Read a non-negative index buffer as host `usize` values.
pub(crate) fn read_counts(what: &str, tensor: &CpuTensor) -> Result<Vec<usize>> {
    tensor
        .to_index_vec()?
        .into_iter()
        .map(|v| {
            usize::try_from(v)
                .map_err(|_| OpError::invalid_args(format!("{what}: negative value {v}")))
        })
        .collect()
}

/// Broadcast a `[1]` or `[n]` per-request buffer to `n` host values.
pub(crate) fn per_request_f32(tensor: Option<&CpuTensor>, n: usize, default: f32) -> Vec<f32> {
    match tensor {
        None => vec![default; n],
        Some(t) if t.numel() == 1 => vec![t.to_f32_vec()[0]; n],
        Some(t) => t.to_f32_vec(),
    }
}
