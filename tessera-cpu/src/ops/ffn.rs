//! FfnOps implementation for CpuBackend.
//!
//! The block is composed from the backend's own GEMM and layernorm ops so
//! the math matches what the attention layer issues for its projections.

use tessera::backend::{FfnOps, GemmOps, NormOps};
use tessera::dtype::DType;
use tessera::lora::{apply_lora, request_spans, LoraSpan};
use tessera::params::{FfnLayerParams, GemmParams, LayerNormOpType, LayernormParams};
use tessera::tensor::Tensor;
use tessera::weights::{DenseWeights, LoraWeightsMap};
use tessera::Result;
use tracing::trace;

use super::activation::{activation_fn, sigmoid};
use crate::tensor::CpuTensor;
use crate::CpuBackend;

const DENSE_LAYERNORM_EPS: f32 = 1e-5;

/// `x · W (+ bias)` plus per-request adapter deltas, as an f32 buffer.
fn project(
    x: &CpuTensor,
    dense: &DenseWeights<CpuTensor>,
    lora: Option<&LoraWeightsMap<CpuTensor>>,
    spans: &[LoraSpan],
) -> Result<CpuTensor> {
    let mut out = CpuTensor::try_zeros(&[x.rows(), dense.kernel.last_dim()], DType::F32)?;
    CpuBackend::gemm(GemmParams::new(x, &dense.kernel, &mut out))?;
    if let Some(bias) = &dense.bias {
        let bias = bias.to_f32_vec();
        let data = out.as_f32_slice_mut();
        for row in data.chunks_mut(bias.len().max(1)) {
            for (v, b) in row.iter_mut().zip(&bias) {
                *v += b;
            }
        }
    }
    apply_lora::<CpuBackend>(x, lora, &mut out, spans)?;
    Ok(out)
}

impl FfnOps for CpuBackend {
    fn ffn_layer(params: FfnLayerParams<'_, CpuTensor>) -> Result<()> {
        params.validate()?;
        let weights = params.weights;
        let x = params.input;
        let tokens = x.rows();
        trace!(
            tokens,
            activation = ?params.activation_type,
            gated = params.activation_type.is_gated(),
            "ffn_layer"
        );

        let spans = match (params.lora_ids, params.lora_input_lengths) {
            (Some(ids), Some(lengths)) => {
                request_spans(&ids.to_index_vec()?, &lengths.to_index_vec()?, tokens)?
            }
            _ => Vec::new(),
        };

        let act = activation_fn(params.activation_type)?;
        let mut h = project(
            x,
            &weights.intermediate_weight,
            weights.intermediate_lora_weights.as_ref(),
            &spans,
        )?;
        match &weights.intermediate_weight3 {
            Some(gate_weight) if params.activation_type.is_gated() => {
                let gate = project(
                    x,
                    gate_weight,
                    weights.intermediate_lora_weights3.as_ref(),
                    &spans,
                )?;
                for (up, &g) in h.as_f32_slice_mut().iter_mut().zip(gate.as_f32_slice()) {
                    *up *= act(g);
                }
            }
            _ => {
                for v in h.as_f32_slice_mut() {
                    *v = act(*v);
                }
            }
        }

        if let Some(norm) = &weights.dense_layernorm {
            let mut normed = CpuTensor::try_zeros(h.shape(), DType::F32)?;
            let mut ln = LayernormParams::new(
                LayerNormOpType::Layernorm,
                &h,
                &norm.gamma,
                DENSE_LAYERNORM_EPS,
                &mut normed,
            );
            if let Some(beta) = &norm.beta {
                ln = ln.with_beta(beta);
            }
            CpuBackend::layernorm(ln)?;
            h = normed;
        }

        let mut out = match &weights.intermediate_weight2 {
            Some(down) => project(&h, down, weights.intermediate_lora_weights2.as_ref(), &spans)?,
            None => h,
        };

        if let Some(gating) = &weights.gating_weights {
            let gates = project(x, gating, None, &[])?;
            let width = out.last_dim();
            let data = out.as_f32_slice_mut();
            for (row, &g) in data.chunks_mut(width.max(1)).zip(gates.as_f32_slice()) {
                let factor = sigmoid(g);
                for v in row {
                    *v *= factor;
                }
            }
        }

        params.output.write_f32(out.as_f32_slice());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tessera::params::ActivationType;
    use tessera::weights::{FfnLayerWeights, LayerNormWeights, LoraWeights};
    use tessera::OpErrorType;

    fn assert_close(got: &[f32], expected: &[f32]) {
        assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(expected) {
            assert!((g - e).abs() < 1e-4, "got {got:?}, expected {expected:?}");
        }
    }

    fn identity2() -> CpuTensor {
        CpuTensor::from_f32(&[2, 2], &[1.0, 0.0, 0.0, 1.0])
    }

    #[test]
    fn test_ungated_relu_with_bias() {
        let x = CpuTensor::from_f32(&[1, 2], &[1.0, -3.0]);
        let bias = CpuTensor::from_f32(&[2], &[0.5, 0.5]);
        let weights = FfnLayerWeights::new(DenseWeights::new(identity2()).with_bias(bias));
        let mut out = CpuTensor::zeros(&[1, 2], DType::F32);
        CpuBackend::ffn_layer(FfnLayerParams::new(&x, &mut out, &weights, ActivationType::Relu))
            .unwrap();
        assert_close(out.as_f32_slice(), &[1.5, 0.0]);
    }

    #[test]
    fn test_gated_silu_with_down_projection() {
        let x = CpuTensor::from_f32(&[1, 2], &[1.0, 2.0]);
        let mut weights = FfnLayerWeights::new(DenseWeights::new(identity2()));
        weights.intermediate_weight3 = Some(DenseWeights::new(identity2()));
        weights.intermediate_weight2 = Some(DenseWeights::new(CpuTensor::from_f32(
            &[2, 1],
            &[1.0, 1.0],
        )));
        let mut out = CpuTensor::zeros(&[1, 1], DType::F32);
        CpuBackend::ffn_layer(FfnLayerParams::new(
            &x,
            &mut out,
            &weights,
            ActivationType::SiGLU,
        ))
        .unwrap();
        let silu = |v: f32| v / (1.0 + (-v).exp());
        assert_close(out.as_f32_slice(), &[silu(1.0) * 1.0 + silu(2.0) * 2.0]);
    }

    #[test]
    fn test_dense_layernorm_and_gating() {
        let x = CpuTensor::from_f32(&[1, 2], &[1.0, 3.0]);
        let mut weights = FfnLayerWeights::new(DenseWeights::new(identity2()));
        weights.dense_layernorm = Some(LayerNormWeights {
            gamma: CpuTensor::from_f32(&[2], &[1.0, 1.0]),
            beta: None,
        });
        weights.gating_weights = Some(DenseWeights::new(CpuTensor::from_f32(
            &[2, 1],
            &[0.0, 0.0],
        )));
        let mut out = CpuTensor::zeros(&[1, 2], DType::F32);
        CpuBackend::ffn_layer(FfnLayerParams::new(
            &x,
            &mut out,
            &weights,
            ActivationType::Identity,
        ))
        .unwrap();
        // normalized [-1, 1], then halved by sigmoid(0)
        assert_close(out.as_f32_slice(), &[-0.5, 0.5]);
    }

    #[test]
    fn test_lora_applies_only_to_selected_request() {
        let x = CpuTensor::from_f32(&[2, 2], &[1.0, 1.0, 1.0, 1.0]);
        let mut weights = FfnLayerWeights::new(DenseWeights::new(identity2()));
        let mut map = HashMap::new();
        map.insert(
            "7".to_string(),
            LoraWeights {
                a: CpuTensor::from_f32(&[2, 1], &[1.0, 1.0]),
                b: CpuTensor::from_f32(&[1, 2], &[1.0, 0.0]),
                a_scale: None,
                b_scale: None,
            },
        );
        weights.intermediate_lora_weights = Some(map);
        let ids = CpuTensor::from_i32(&[2], &[-1, 7]);
        let lengths = CpuTensor::from_i32(&[2], &[1, 1]);
        let mut out = CpuTensor::zeros(&[2, 2], DType::F32);
        CpuBackend::ffn_layer(
            FfnLayerParams::new(&x, &mut out, &weights, ActivationType::Identity)
                .with_lora(&ids, &lengths),
        )
        .unwrap();
        assert_close(out.as_f32_slice(), &[1.0, 1.0, 3.0, 1.0]);
    }

    #[test]
    fn test_invalid_activation_is_unimplemented() {
        let x = CpuTensor::from_f32(&[1, 2], &[1.0, 2.0]);
        let weights = FfnLayerWeights::new(DenseWeights::new(identity2()));
        let mut out = CpuTensor::zeros(&[1, 2], DType::F32);
        let err = CpuBackend::ffn_layer(FfnLayerParams::new(
            &x,
            &mut out,
            &weights,
            ActivationType::InvalidType,
        ))
        .unwrap_err();
        assert_eq!(err.error_type(), OpErrorType::Unimplemented);
    }
}
