//! NormOps implementation for CpuBackend.

#![allow(clippy::cast_precision_loss)]

use rayon::prelude::*;
use tessera::backend::NormOps;
use tessera::params::{LayerNormOpType, LayernormParams};
use tessera::tensor::Tensor;
use tessera::Result;
use tracing::trace;

use crate::tensor::CpuTensor;
use crate::CpuBackend;

fn add_into(acc: &mut [f32], other: &[f32], factor: f32) {
    for (a, &o) in acc.iter_mut().zip(other) {
        *a += factor * o;
    }
}

/// Multiply every row by a per-tensor `[1]` or per-channel `[hidden]` factor.
fn scale_rows(data: &mut [f32], scale: &[f32], hidden: usize) {
    for row in data.chunks_mut(hidden) {
        for (i, v) in row.iter_mut().enumerate() {
            *v *= if scale.len() == 1 { scale[0] } else { scale[i] };
        }
    }
}

/// Normalize one row of `pre` into `out` (no affine step).
fn normalize_row(norm_type: LayerNormOpType, pre: &[f32], eps: f32, out: &mut [f32]) {
    let n = pre.len() as f32;
    match norm_type {
        LayerNormOpType::RmsNorm => {
            let ms = pre.iter().map(|v| v * v).sum::<f32>() / n;
            let inv = 1.0 / (ms + eps).sqrt();
            for (o, &v) in out.iter_mut().zip(pre) {
                *o = v * inv;
            }
        }
        _ => {
            let mean = pre.iter().sum::<f32>() / n;
            let var = pre.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
            let inv = 1.0 / (var + eps).sqrt();
            for (o, &v) in out.iter_mut().zip(pre) {
                *o = (v - mean) * inv;
            }
        }
    }
}

impl NormOps for CpuBackend {
    fn layernorm(mut params: LayernormParams<'_, CpuTensor>) -> Result<()> {
        let hidden = params.validate()?;
        let norm_type = params.norm_type;
        trace!(?norm_type, hidden, rows = params.input.rows(), "layernorm");

        let alpha = if norm_type == LayerNormOpType::AlphaNorm {
            params.alpha
        } else {
            1.0
        };
        let mut pre = params.input.to_f32_vec();
        if let Some(scale) = params.scale_inter {
            scale_rows(&mut pre, &scale.to_f32_vec(), hidden);
        }
        if let Some(r) = params.residual1 {
            add_into(&mut pre, &r.to_f32_vec(), alpha);
        }
        if let Some(r) = params.residual2 {
            add_into(&mut pre, &r.to_f32_vec(), 1.0);
        }
        if let Some(bias) = params.bias {
            let bias = bias.to_f32_vec();
            for row in pre.chunks_mut(hidden) {
                add_into(row, &bias, 1.0);
            }
        }

        let gamma = params.gamma.to_f32_vec();
        // RmsNorm has no shift.
        let beta = match (norm_type, params.beta) {
            (LayerNormOpType::RmsNorm, _) | (_, None) => None,
            (_, Some(b)) => Some(b.to_f32_vec()),
        };
        let scale = params.scale.map(CpuTensor::to_f32_vec);
        let eps = params.eps;

        let mut out = vec![0.0f32; pre.len()];
        let row_max: Vec<f32> = out
            .par_chunks_mut(hidden)
            .zip(pre.par_chunks(hidden))
            .map(|(out_row, pre_row)| {
                normalize_row(norm_type, pre_row, eps, out_row);
                let mut max_abs = 0.0f32;
                for (i, o) in out_row.iter_mut().enumerate() {
                    *o *= gamma[i];
                    if let Some(beta) = &beta {
                        *o += beta[i];
                    }
                    if let Some(scale) = &scale {
                        *o *= if scale.len() == 1 { scale[0] } else { scale[i] };
                    }
                    max_abs = max_abs.max(o.abs());
                }
                max_abs
            })
            .collect();

        if let Some(residual_out) = params.residual_output.as_deref_mut() {
            match params.scale_out {
                Some(scale) => {
                    let mut stored = pre.clone();
                    scale_rows(&mut stored, &scale.to_f32_vec(), hidden);
                    residual_out.write_f32(&stored);
                }
                None => residual_out.write_f32(&pre),
            }
        }
        if let Some(ds) = params.dynamic_scale.as_deref_mut() {
            let scales: Vec<f32> = row_max.iter().map(|m| m / 127.0).collect();
            ds.write_f32(&scales);
        }
        params.norm_output.write_f32(&out);
        Ok(())
    }
}
