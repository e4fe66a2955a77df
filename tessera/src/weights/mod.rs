//! Static description of a transformer's learned parameters.
//!
//! The tree mirrors the decoder's layer structure. Every optional slot is a
//! plain `Option`: an absent slot means the step that consumes it is skipped
//! for this model, never replaced with an identity default. Construction and
//! shape validation belong to the model loader; this module only offers
//! structured read access.

use std::collections::HashMap;

/// Scale/shift pair for any normalization variant.
///
/// `beta` is absent for RMS-normalized models.
#[derive(Debug, Clone)]
pub struct LayerNormWeights<T> {
    pub gamma: T,
    pub beta: Option<T>,
}

/// Linear projection: `kernel` is stored `(in_features, out_features)`.
#[derive(Debug, Clone)]
pub struct DenseWeights<T> {
    pub kernel: T,
    pub bias: Option<T>,
}

impl<T> DenseWeights<T> {
    /// Projection without bias.
    pub fn new(kernel: T) -> Self {
        Self { kernel, bias: None }
    }

    #[must_use]
    pub fn with_bias(mut self, bias: T) -> Self {
        self.bias = Some(bias);
        self
    }
}

/// Low-rank adapter: `delta = (x · A) · B`, with optional quantization
/// scales for each factor.
#[derive(Debug, Clone)]
pub struct LoraWeights<T> {
    pub a: T,
    pub b: T,
    pub a_scale: Option<T>,
    pub b_scale: Option<T>,
}

/// Adapters keyed by adapter id. Several adapters can be active on the same
/// projection at once, one per request.
pub type LoraWeightsMap<T> = HashMap<String, LoraWeights<T>>;

/// Look up the adapter for a request's numeric adapter id.
///
/// Negative ids mean "no adapter". Ids are matched against the decimal form
/// of the map key.
#[must_use]
pub fn lora_for_id<T>(map: Option<&LoraWeightsMap<T>>, id: i64) -> Option<&LoraWeights<T>> {
    if id < 0 {
        return None;
    }
    map?.get(&id.to_string())
}

#[derive(Debug, Clone)]
pub struct AttentionLayerWeights<T> {
    pub pre_layernorm: Option<LayerNormWeights<T>>,
    pub pre_attention_layernorm: Option<LayerNormWeights<T>>,
    /// Fused QKV projection, `(hidden, (heads + 2 * kv_heads) * head_dim)`.
    pub query_weight: DenseWeights<T>,
    pub query_lora_weights: Option<LoraWeightsMap<T>>,
    pub attention_layernorm: Option<LayerNormWeights<T>>,
    pub attention_output_weight: DenseWeights<T>,
    pub attention_output_lora_weights: Option<LoraWeightsMap<T>>,
    pub post_layernorm: Option<LayerNormWeights<T>>,
}

impl<T> AttentionLayerWeights<T> {
    /// Attention weights with only the two required projections populated.
    pub fn new(query_weight: DenseWeights<T>, attention_output_weight: DenseWeights<T>) -> Self {
        Self {
            pre_layernorm: None,
            pre_attention_layernorm: None,
            query_weight,
            query_lora_weights: None,
            attention_layernorm: None,
            attention_output_weight,
            attention_output_lora_weights: None,
            post_layernorm: None,
        }
    }
}

/// Feed-forward weights.
///
/// - `intermediate_weight`: up projection (`hidden → inter`), required.
/// - `intermediate_weight2`: down projection (`inter → hidden`).
/// - `intermediate_weight3`: gate projection for gated activations.
/// - `dense_layernorm`: normalizes the activated intermediate.
/// - `gating_weights`: `(hidden, 1)` sigmoid gate on the block output.
#[derive(Debug, Clone)]
pub struct FfnLayerWeights<T> {
    pub intermediate_weight: DenseWeights<T>,
    pub intermediate_lora_weights: Option<LoraWeightsMap<T>>,
    pub intermediate_weight2: Option<DenseWeights<T>>,
    pub intermediate_lora_weights2: Option<LoraWeightsMap<T>>,
    pub intermediate_weight3: Option<DenseWeights<T>>,
    pub intermediate_lora_weights3: Option<LoraWeightsMap<T>>,
    pub dense_layernorm: Option<LayerNormWeights<T>>,
    pub gating_weights: Option<DenseWeights<T>>,
}

impl<T> FfnLayerWeights<T> {
    pub fn new(intermediate_weight: DenseWeights<T>) -> Self {
        Self {
            intermediate_weight,
            intermediate_lora_weights: None,
            intermediate_weight2: None,
            intermediate_lora_weights2: None,
            intermediate_weight3: None,
            intermediate_lora_weights3: None,
            dense_layernorm: None,
            gating_weights: None,
        }
    }
}

/// One decoder layer.
#[derive(Debug, Clone)]
pub struct LayerWeights<T> {
    pub self_attention_weights: AttentionLayerWeights<T>,
    pub ffn_weights: FfnLayerWeights<T>,
}

/// Whole-model parameters.
#[derive(Debug, Clone)]
pub struct Weights<T> {
    pub embedding: DenseWeights<T>,
    pub prefix_encoder_embedding: Option<DenseWeights<T>>,
    pub pre_decoder_layernorm: Option<LayerNormWeights<T>>,
    pub position_encoding: Option<DenseWeights<T>>,
    pub layers: Vec<LayerWeights<T>>,
    pub final_layernorm: Option<LayerNormWeights<T>>,
    pub lm_head: Option<DenseWeights<T>>,
    /// Speculative-decoding head.
    pub medusa_head: Option<DenseWeights<T>>,
}

impl<T> Weights<T> {
    /// Model with embedding and layers only; every optional slot empty.
    pub fn new(embedding: DenseWeights<T>, layers: Vec<LayerWeights<T>>) -> Self {
        Self {
            embedding,
            prefix_encoder_embedding: None,
            pre_decoder_layernorm: None,
            position_encoding: None,
            layers,
            final_layernorm: None,
            lm_head: None,
            medusa_head: None,
        }
    }

    /// Decoder depth.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    #[must_use]
    pub fn layer(&self, index: usize) -> Option<&LayerWeights<T>> {
        self.layers.get(index)
    }

    /// Whether the model carries its own output head.
    ///
    /// Models without one tie the head to the embedding table.
    #[must_use]
    pub fn has_lm_head(&self) -> bool {
        self.lm_head.is_some()
    }
}
