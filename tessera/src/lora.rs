//! Per-request low-rank adapter deltas.
//!
//! Packed activations interleave requests that may use different adapters.
//! A delta is applied to each request's row block separately:
//! `out[rows] += (in[rows] · A) · B`.

use crate::backend::{BufferOps, GemmOps};
use crate::error::{OpError, Result};
use crate::params::{CopyParams, GemmParams};
use crate::tensor::Tensor;
use crate::weights::{lora_for_id, LoraWeightsMap};

/// Row block of one request inside a packed activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoraSpan {
    pub adapter_id: i64,
    pub start: usize,
    pub len: usize,
}

/// Split `tokens` packed rows into per-request spans.
///
/// # Errors
/// `InvalidArgs` if the buffers differ in length, a length is negative, or
/// the lengths do not cover exactly `tokens` rows.
pub fn request_spans(ids: &[i64], lengths: &[i64], tokens: usize) -> Result<Vec<LoraSpan>> {
    if ids.len() != lengths.len() {
        return Err(OpError::invalid_args(format!(
            "lora: {} adapter ids for {} request lengths",
            ids.len(),
            lengths.len()
        )));
    }
    let mut spans = Vec::with_capacity(ids.len());
    let mut start = 0;
    for (&adapter_id, &len) in ids.iter().zip(lengths) {
        let len = usize::try_from(len)
            .map_err(|_| OpError::invalid_args(format!("lora: negative length {len}")))?;
        spans.push(LoraSpan {
            adapter_id,
            start,
            len,
        });
        start += len;
    }
    if start != tokens {
        return Err(OpError::invalid_args(format!(
            "lora: lengths cover {start} rows, input has {tokens}"
        )));
    }
    Ok(spans)
}

/// Add each request's adapter delta into `output`.
///
/// Requests with a negative id, or an id missing from `map`, are left
/// untouched. Adapter scales are applied as GEMM operand scales.
///
/// # Errors
/// Propagates copy and GEMM failures.
pub fn apply_lora<B: BufferOps + GemmOps>(
    input: &B::Tensor,
    map: Option<&LoraWeightsMap<B::Tensor>>,
    output: &mut B::Tensor,
    spans: &[LoraSpan],
) -> Result<()> {
    if map.is_none() {
        return Ok(());
    }
    let dtype = input.dtype();
    let in_width = input.last_dim();
    let out_width = output.last_dim();
    for span in spans {
        let Some(lora) = lora_for_id(map, span.adapter_id) else {
            continue;
        };
        if span.len == 0 {
            continue;
        }
        let mut x = B::allocate(&[span.len, in_width], dtype)?;
        B::copy(CopyParams::new(input, &mut x).with_region(
            span.start * in_width,
            0,
            span.len * in_width,
        ))?;

        let mut low_rank = B::allocate(&[span.len, lora.a.last_dim()], dtype)?;
        let mut down = GemmParams::new(&x, &lora.a, &mut low_rank);
        if let Some(scale) = &lora.a_scale {
            down = down.with_b_scale(scale);
        }
        B::gemm(down)?;

        let mut y = B::allocate(&[span.len, out_width], output.dtype())?;
        B::copy(CopyParams::new(&*output, &mut y).with_region(
            span.start * out_width,
            0,
            span.len * out_width,
        ))?;
        let mut up = GemmParams::new(&low_rank, &lora.b, &mut y).beta(1.0);
        if let Some(scale) = &lora.b_scale {
            up = up.with_b_scale(scale);
        }
        B::gemm(up)?;
        B::copy(CopyParams::new(&y, output).with_region(
            0,
            span.start * out_width,
            span.len * out_width,
        ))?;
    }
    Ok(())
}
