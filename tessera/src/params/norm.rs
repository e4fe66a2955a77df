//! Layer normalization contracts.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{OpError, Result};
use crate::tensor::Tensor;

/// Normalization variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerNormOpType {
    /// `(x - mean) / sqrt(var + eps) * gamma + beta`
    Layernorm,
    /// `x / sqrt(mean(x^2) + eps) * gamma`, no shift.
    RmsNorm,
    /// Layernorm over `input + alpha * residual1`.
    AlphaNorm,
    #[serde(skip)]
    InvalidType,
}

impl FromStr for LayerNormOpType {
    type Err = OpError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "layernorm" => Ok(Self::Layernorm),
            "rmsnorm" => Ok(Self::RmsNorm),
            "alphanorm" => Ok(Self::AlphaNorm),
            other => Err(OpError::invalid_args(format!(
                "Norm Type: {other} not supported"
            ))),
        }
    }
}

/// Where a layer applies its normalization relative to the residual add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerNormType {
    PreLayernorm,
    PostLayernorm,
    #[serde(skip)]
    InvalidType,
}

impl FromStr for LayerNormType {
    type Err = OpError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pre_layernorm" => Ok(Self::PreLayernorm),
            "post_layernorm" => Ok(Self::PostLayernorm),
            other => Err(OpError::invalid_args(format!(
                "Layernorm Type: {other} not supported"
            ))),
        }
    }
}

/// Fused `bias + residual + normalize`.
///
/// The backend first forms
/// `pre = input * scale_inter + alpha * residual1 + residual2 + bias`
/// (`alpha` only used by `AlphaNorm`, otherwise 1), optionally stores
/// `pre * scale_out` into `residual_output`, then writes the normalized rows
/// of `pre` to `norm_output`.
pub struct LayernormParams<'a, T> {
    pub norm_type: LayerNormOpType,
    pub input: &'a T,
    pub residual1: Option<&'a T>,
    pub residual2: Option<&'a T>,
    pub bias: Option<&'a T>,
    pub gamma: &'a T,
    pub beta: Option<&'a T>,
    pub eps: f32,
    pub alpha: f32,

    /// Per-tensor `[1]` or per-channel `[hidden]` dequantization factor of
    /// `input`.
    pub scale_inter: Option<&'a T>,
    /// Per-tensor `[1]` or per-channel `[hidden]` quantization factor of
    /// the value stored in `residual_output`.
    pub scale_out: Option<&'a T>,
    /// Per-tensor `[1]` or per-channel `[hidden]` factor applied to the
    /// normalized output.
    pub scale: Option<&'a T>,
    /// `[rows]` output receiving `max|out| / 127` per row.
    pub dynamic_scale: Option<&'a mut T>,
    pub residual_output: Option<&'a mut T>,

    pub norm_output: &'a mut T,
}

impl<'a, T: Tensor> LayernormParams<'a, T> {
    pub fn new(
        norm_type: LayerNormOpType,
        input: &'a T,
        gamma: &'a T,
        eps: f32,
        norm_output: &'a mut T,
    ) -> Self {
        Self {
            norm_type,
            input,
            residual1: None,
            residual2: None,
            bias: None,
            gamma,
            beta: None,
            eps,
            alpha: 1.0,
            scale_inter: None,
            scale_out: None,
            scale: None,
            dynamic_scale: None,
            residual_output: None,
            norm_output,
        }
    }

    #[must_use]
    pub fn with_beta(mut self, beta: &'a T) -> Self {
        self.beta = Some(beta);
        self
    }

    #[must_use]
    pub fn with_residual1(mut self, residual: &'a T) -> Self {
        self.residual1 = Some(residual);
        self
    }

    #[must_use]
    pub fn with_residual2(mut self, residual: &'a T) -> Self {
        self.residual2 = Some(residual);
        self
    }

    #[must_use]
    pub fn with_bias(mut self, bias: &'a T) -> Self {
        self.bias = Some(bias);
        self
    }

    #[must_use]
    pub fn alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    #[must_use]
    pub fn with_scale_inter(mut self, scale: &'a T) -> Self {
        self.scale_inter = Some(scale);
        self
    }

    #[must_use]
    pub fn with_scale_out(mut self, scale: &'a T) -> Self {
        self.scale_out = Some(scale);
        self
    }

    #[must_use]
    pub fn with_scale(mut self, scale: &'a T) -> Self {
        self.scale = Some(scale);
        self
    }

    #[must_use]
    pub fn with_dynamic_scale(mut self, out: &'a mut T) -> Self {
        self.dynamic_scale = Some(out);
        self
    }

    #[must_use]
    pub fn with_residual_output(mut self, out: &'a mut T) -> Self {
        self.residual_output = Some(out);
        self
    }

    /// Validate shapes and return the normalized width.
    ///
    /// # Errors
    /// `Unimplemented` for `InvalidType`; `InvalidArgs` for any shape
    /// mismatch or a negative epsilon.
    pub fn validate(&self) -> Result<usize> {
        if self.norm_type == LayerNormOpType::InvalidType {
            return Err(OpError::unimplemented("layernorm: invalid norm type"));
        }
        if self.eps < 0.0 || !self.eps.is_finite() {
            return Err(OpError::invalid_args(format!(
                "layernorm: eps must be finite and >= 0, got {}",
                self.eps
            )));
        }
        let hidden = self.gamma.numel();
        let shape = self.input.shape();
        if hidden == 0 {
            return Err(OpError::invalid_args("layernorm: empty gamma"));
        }
        if self.input.last_dim() != hidden {
            return Err(OpError::invalid_args(format!(
                "layernorm: input {shape:?} last dim != gamma length {hidden}"
            )));
        }
        for (what, t) in [("residual1", self.residual1), ("residual2", self.residual2)] {
            if let Some(t) = t {
                same_shape(what, t.shape(), shape)?;
            }
        }
        for (what, t) in [("bias", self.bias), ("beta", self.beta)] {
            if let Some(t) = t {
                if t.numel() != hidden {
                    return Err(OpError::invalid_args(format!(
                        "layernorm: {what} must have {hidden} elements, got {}",
                        t.numel()
                    )));
                }
            }
        }
        for (what, t) in [
            ("scale_inter", self.scale_inter),
            ("scale_out", self.scale_out),
            ("scale", self.scale),
        ] {
            if let Some(s) = t {
                if s.numel() != 1 && s.numel() != hidden {
                    return Err(OpError::invalid_args(format!(
                        "layernorm: {what} must have 1 or {hidden} elements, got {}",
                        s.numel()
                    )));
                }
            }
        }
        same_shape("norm_output", self.norm_output.shape(), shape)?;
        if let Some(out) = self.residual_output.as_deref() {
            same_shape("residual_output", out.shape(), shape)?;
        }
        if let Some(ds) = self.dynamic_scale.as_deref() {
            if ds.numel() != self.input.rows() {
                return Err(OpError::invalid_args(format!(
                    "layernorm: dynamic_scale must have {} elements, got {}",
                    self.input.rows(),
                    ds.numel()
                )));
            }
        }
        Ok(hidden)
    }
}

fn same_shape(what: &str, got: &[usize], expected: &[usize]) -> Result<()> {
    if got == expected {
        Ok(())
    } else {
        Err(OpError::invalid_args(format!(
            "layernorm: {what} shape {got:?} != input shape {expected:?}"
        )))
    }
}
