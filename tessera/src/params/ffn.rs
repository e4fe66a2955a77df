//! Feed-forward layer contract.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{OpError, Result};
use crate::tensor::{expect_index, expect_numel, expect_shape, Tensor};
use crate::weights::{DenseWeights, FfnLayerWeights};

/// Activation applied to the intermediate projection.
///
/// The `*GLU` variants are gated: the activation runs on the gate
/// projection (`intermediate_weight3`) and multiplies the up projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationType {
    #[serde(rename = "gelu")]
    Gelu,
    #[serde(rename = "gelu_none_approximate")]
    GeluNoneApproximate,
    #[serde(rename = "relu")]
    Relu,
    #[serde(rename = "silu")]
    Silu,
    #[serde(rename = "geglu")]
    GeGLU,
    #[serde(rename = "geglu_none_approximate")]
    GeGluNoneApproximate,
    #[serde(rename = "reglu")]
    ReGLU,
    #[serde(rename = "siglu")]
    SiGLU,
    #[serde(rename = "identity")]
    Identity,
    #[serde(skip)]
    InvalidType,
}

impl ActivationType {
    #[must_use]
    pub const fn is_gated(self) -> bool {
        matches!(
            self,
            Self::GeGLU | Self::GeGluNoneApproximate | Self::ReGLU | Self::SiGLU
        )
    }
}

impl FromStr for ActivationType {
    type Err = OpError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "gelu" | "gelu_tanh" => Self::Gelu,
            "gelu_none_approximate" | "gelu_erf" => Self::GeluNoneApproximate,
            "relu" => Self::Relu,
            "silu" | "swish" => Self::Silu,
            "geglu" => Self::GeGLU,
            "geglu_none_approximate" => Self::GeGluNoneApproximate,
            "reglu" => Self::ReGLU,
            "siglu" | "swiglu" => Self::SiGLU,
            "identity" => Self::Identity,
            other => {
                return Err(OpError::invalid_args(format!(
                    "Activation Type: {other} not supported"
                )))
            }
        })
    }
}

/// One feed-forward block over packed tokens `[tokens, hidden]`.
pub struct FfnLayerParams<'p, T> {
    pub input: &'p T,
    pub output: &'p mut T,

    pub weights: &'p FfnLayerWeights<T>,
    pub activation_type: ActivationType,

    /// `[batch]` adapter ids, negative means no adapter.
    pub lora_ids: Option<&'p T>,
    /// `[batch]` token counts splitting `input` into requests.
    pub lora_input_lengths: Option<&'p T>,
}

impl<'p, T: Tensor> FfnLayerParams<'p, T> {
    pub fn new(
        input: &'p T,
        output: &'p mut T,
        weights: &'p FfnLayerWeights<T>,
        activation_type: ActivationType,
    ) -> Self {
        Self {
            input,
            output,
            weights,
            activation_type,
            lora_ids: None,
            lora_input_lengths: None,
        }
    }

    #[must_use]
    pub fn with_lora(mut self, ids: &'p T, input_lengths: &'p T) -> Self {
        self.lora_ids = Some(ids);
        self.lora_input_lengths = Some(input_lengths);
        self
    }

    /// # Errors
    /// `Unimplemented` for `InvalidType`; `InvalidArgs` when a gated
    /// activation has no gate projection, when projection kernels or biases
    /// do not chain, when the output shape is wrong, or when the LoRA
    /// buffers are inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.activation_type == ActivationType::InvalidType {
            return Err(OpError::unimplemented("ffn: invalid activation type"));
        }
        if self.input.ndim() != 2 {
            return Err(OpError::invalid_args(format!(
                "ffn: input must be [tokens, hidden], got {:?}",
                self.input.shape()
            )));
        }
        if self.activation_type.is_gated() && self.weights.intermediate_weight3.is_none() {
            return Err(OpError::invalid_args(format!(
                "ffn: {:?} requires intermediate_weight3",
                self.activation_type
            )));
        }
        let tokens = self.input.shape()[0];
        let hidden = self.input.last_dim();
        let w = self.weights;
        let inter = check_dense("intermediate_weight", &w.intermediate_weight, hidden)?;
        if let Some(gate) = &w.intermediate_weight3 {
            check_dense("intermediate_weight3", gate, hidden)?;
            expect_shape(
                "intermediate_weight3",
                &gate.kernel,
                w.intermediate_weight.kernel.shape(),
            )?;
        }
        let out_width = match &w.intermediate_weight2 {
            Some(down) => check_dense("intermediate_weight2", down, inter)?,
            None => inter,
        };
        expect_shape("ffn output", self.output, &[tokens, out_width])?;
        if let Some(g) = &w.gating_weights {
            check_dense("gating_weights", g, hidden)?;
            expect_shape("gating_weights", &g.kernel, &[hidden, 1])?;
        }
        match (self.lora_ids, self.lora_input_lengths) {
            (None, None) => Ok(()),
            (Some(ids), Some(lengths)) => {
                expect_index("lora_ids", ids)?;
                expect_index("lora_input_lengths", lengths)?;
                expect_numel("lora_input_lengths", lengths, ids.numel())
            }
            _ => Err(OpError::invalid_args(
                "ffn: lora_ids and lora_input_lengths must be given together",
            )),
        }
    }
}

/// A `[rows, n]` kernel with an optional `[n]` bias. Returns `n`.
fn check_dense<T: Tensor>(what: &str, dense: &DenseWeights<T>, rows: usize) -> Result<usize> {
    let kernel = dense.kernel.shape();
    if kernel.len() != 2 || kernel[0] != rows {
        return Err(OpError::invalid_args(format!(
            "ffn: {what} must be [{rows}, n], got {kernel:?}"
        )));
    }
    let width = kernel[1];
    if let Some(bias) = &dense.bias {
        expect_numel(&format!("{what} bias"), bias, width)?;
    }
    Ok(width)
}
