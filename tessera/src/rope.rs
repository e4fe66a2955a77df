//! Rotary position embedding math.
//!
//! Pure host-side helpers shared by every backend: the effective rotary base
//! for each [`PositionEmbeddingStyle`], per-position cos/sin pairs, the
//! in-place rotation of one head, and the log-N query scale.

#![allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]

use serde::{Deserialize, Serialize};

use crate::params::AttentionConfigs;

/// How rotary frequencies are derived and which lanes are paired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEmbeddingStyle {
    /// `theta_i = pos * base^(-2i/dim)`, rotate-half pairing.
    #[default]
    BaseRotaryEmbedding,
    /// Positions divided by `position_embeddings_scale`.
    LinearScalar,
    /// Base stretched once by `dynamic_embedding_scalar`.
    #[serde(rename = "ntk_scalar")]
    NTKScalar,
    /// Base stretched only once the sequence outgrows
    /// `dynamic_embedding_max_pos`.
    #[serde(rename = "dynamic_ntks")]
    DynamicNTKS,
    /// Interleaved `(2i, 2i+1)` pairing.
    #[serde(rename = "glm")]
    GLM,
}

/// Lane pairing of a rotary rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotaryLayout {
    /// Lane `i` pairs with lane `i + dim/2`.
    RotateHalf,
    /// Lane `2i` pairs with lane `2i + 1`.
    Interleaved,
}

impl PositionEmbeddingStyle {
    #[must_use]
    pub const fn layout(self) -> RotaryLayout {
        match self {
            Self::GLM => RotaryLayout::Interleaved,
            _ => RotaryLayout::RotateHalf,
        }
    }
}

/// Effective rotary base for a sequence currently `seq_len` tokens long.
#[must_use]
pub fn rotary_base(configs: &AttentionConfigs, seq_len: usize) -> f64 {
    let dim = configs.rotary_embedding_dim as f64;
    let base = configs.rotary_embedding_base as f64 * configs.base_scale as f64;
    let exponent = if dim > 2.0 { dim / (dim - 2.0) } else { 1.0 };
    let scalar = configs.dynamic_embedding_scalar;
    match configs.position_embedding_style {
        PositionEmbeddingStyle::NTKScalar if scalar > 1.0 => base * scalar.powf(exponent),
        PositionEmbeddingStyle::DynamicNTKS => {
            let max_pos = configs.dynamic_embedding_max_pos;
            if max_pos > 0 && seq_len > max_pos && scalar > 0.0 {
                let ratio = scalar * seq_len as f64 / max_pos as f64 - (scalar - 1.0);
                base * ratio.powf(exponent)
            } else {
                base
            }
        }
        _ => base,
    }
}

/// `(cos, sin)` for each rotary pair at position `pos`.
///
/// Returns an empty vector when rotary embedding is disabled
/// (`rotary_embedding_dim == 0`).
#[must_use]
pub fn rotary_cos_sin(configs: &AttentionConfigs, pos: usize, seq_len: usize) -> Vec<(f32, f32)> {
    let dim = configs.rotary_embedding_dim;
    if dim == 0 {
        return Vec::new();
    }
    let base = rotary_base(configs, seq_len);
    let mut pos = pos as f64;
    if configs.position_embedding_style == PositionEmbeddingStyle::LinearScalar
        && configs.position_embeddings_scale > 1
    {
        pos /= configs.position_embeddings_scale as f64;
    }
    (0..dim / 2)
        .map(|i| {
            let inv_freq = base.powf(-2.0 * i as f64 / dim as f64);
            let angle = pos * inv_freq;
            (angle.cos() as f32, angle.sin() as f32)
        })
        .collect()
}

/// Rotate the first `2 * cos_sin.len()` lanes of one head in place.
pub fn apply_rotary(head: &mut [f32], cos_sin: &[(f32, f32)], layout: RotaryLayout) {
    let half = cos_sin.len();
    debug_assert!(head.len() >= 2 * half);
    for (i, &(cos, sin)) in cos_sin.iter().enumerate() {
        let (lo, hi) = match layout {
            RotaryLayout::RotateHalf => (i, i + half),
            RotaryLayout::Interleaved => (2 * i, 2 * i + 1),
        };
        let x0 = head[lo];
        let x1 = head[hi];
        head[lo] = x0 * cos - x1 * sin;
        head[hi] = x1 * cos + x0 * sin;
    }
}

/// Query multiplier for log-N attention scaling at position `pos`.
///
/// `ln(pos + 1) / ln(logn_seq_len)` past the trained window, 1 otherwise.
#[must_use]
pub fn logn_scale(configs: &AttentionConfigs, pos: usize) -> f32 {
    let window = configs.logn_seq_len;
    if !configs.use_logn_attn || window < 2 || pos + 1 <= window {
        return 1.0;
    }
    ((pos as f64 + 1.0).ln() / (window as f64).ln()) as f32
}
