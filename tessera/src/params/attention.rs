//! Attention module and attention layer contracts.
//!
//! # Buffer layouts
//!
//! Tokens are packed: sequence `i` contributes `input_lengths[i]` rows, in
//! batch order. With `H = head_num`, `KV = kv_head_num`, `D = size_per_head`:
//!
//! | buffer                  | shape                                   |
//! |-------------------------|-----------------------------------------|
//! | module input (fused QKV)| `[tokens, (H + 2*KV) * D]`              |
//! | module output (context) | `[tokens, H * D]`                       |
//! | `kv_cache_blocks`       | `[batch, 2, KV, capacity, D]`           |
//! | `kv_cache_scales`       | `[batch, 2, KV]`                        |
//! | `input_lengths`         | `[batch]` new tokens per sequence       |
//! | `sequence_lengths`      | `[batch]` tokens already cached         |
//! | `cu_seqlens`            | `[batch + 1]` prefix sums of inputs     |
//! | `padding_offset`        | `[tokens]`                              |
//! | `position_ids`          | `[tokens]`                              |
//! | `attention_mask`        | `[batch, max_seq_length, max_seq_length]`|
//! | `linear_bias_slopes`    | `[H]`                                   |
//! | `prefix_prompt_lengths` | `[batch]`                               |
//! | `lora_ids`              | `[batch]`, negative means no adapter    |
//!
//! Every buffer is rank-local: on a tensor-parallel rank the head counts,
//! cache and slopes describe this rank's head shard only.

use serde::{Deserialize, Serialize};

use crate::error::{OpError, Result};
use crate::rope::PositionEmbeddingStyle;
use crate::tensor::{expect_index, expect_numel, expect_shape, Tensor};
use crate::weights::AttentionLayerWeights;

/// Static attention hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfigs {
    pub head_num: usize,
    pub kv_head_num: usize,
    pub size_per_head: usize,

    pub position_embedding_style: PositionEmbeddingStyle,
    /// Number of leading lanes of each head that are rotated. 0 disables
    /// rotary embedding.
    pub rotary_embedding_dim: usize,
    pub rotary_embedding_base: i64,
    pub dynamic_embedding_scalar: f64,
    pub dynamic_embedding_max_pos: usize,
    pub position_embeddings_scale: i64,
    pub base_scale: i64,

    pub use_logn_attn: bool,
    pub logn_seq_len: usize,

    /// Extra divisor of the softmax temperature `sqrt(size_per_head)`.
    pub q_scaling: f32,
}

impl Default for AttentionConfigs {
    fn default() -> Self {
        Self {
            head_num: 1,
            kv_head_num: 1,
            size_per_head: 1,
            position_embedding_style: PositionEmbeddingStyle::BaseRotaryEmbedding,
            rotary_embedding_dim: 0,
            rotary_embedding_base: 10000,
            dynamic_embedding_scalar: 0.0,
            dynamic_embedding_max_pos: 0,
            position_embeddings_scale: 1,
            base_scale: 1,
            use_logn_attn: false,
            logn_seq_len: 2048,
            q_scaling: 1.0,
        }
    }
}

impl AttentionConfigs {
    /// Configs for the given head geometry with every optional feature off.
    #[must_use]
    pub fn new(head_num: usize, kv_head_num: usize, size_per_head: usize) -> Self {
        Self {
            head_num,
            kv_head_num,
            size_per_head,
            ..Self::default()
        }
    }

    /// Width of the fused QKV projection output.
    #[must_use]
    pub fn qkv_width(&self) -> usize {
        (self.head_num + 2 * self.kv_head_num) * self.size_per_head
    }

    /// Width of the attention context (and the output projection input).
    #[must_use]
    pub fn hidden_units(&self) -> usize {
        self.head_num * self.size_per_head
    }

    /// `1 / (sqrt(size_per_head) * q_scaling)`
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn softmax_scale(&self) -> f32 {
        1.0 / ((self.size_per_head as f32).sqrt() * self.q_scaling)
    }

    /// The configs seen by one rank of a `world_size`-way head split.
    ///
    /// KV heads are never replicated, so every rank must own at least one.
    ///
    /// # Errors
    /// `InvalidArgs` if either head count is not divisible by `world_size`
    /// or there are fewer KV heads than ranks.
    pub fn shard(&self, world_size: usize) -> Result<Self> {
        if world_size == 0 || self.head_num % world_size != 0 {
            return Err(OpError::invalid_args(format!(
                "attention: {} heads cannot be split {world_size} ways",
                self.head_num
            )));
        }
        if self.kv_head_num < world_size {
            return Err(OpError::invalid_args(format!(
                "attention: kv_head_num {} < world_size {world_size}; \
                 replicating kv heads across ranks is not supported",
                self.kv_head_num
            )));
        }
        if self.kv_head_num % world_size != 0 {
            return Err(OpError::invalid_args(format!(
                "attention: {} kv heads cannot be split {world_size} ways",
                self.kv_head_num
            )));
        }
        Ok(Self {
            head_num: self.head_num / world_size,
            kv_head_num: self.kv_head_num / world_size,
            ..self.clone()
        })
    }

    /// # Errors
    /// `InvalidArgs` for zero head counts, a non-divisible GQA ratio, an odd
    /// or oversized rotary width, or a non-positive `q_scaling`.
    pub fn validate(&self) -> Result<()> {
        if self.head_num == 0 || self.kv_head_num == 0 || self.size_per_head == 0 {
            return Err(OpError::invalid_args(format!(
                "attention: head_num={}, kv_head_num={}, size_per_head={} must all be > 0",
                self.head_num, self.kv_head_num, self.size_per_head
            )));
        }
        if self.head_num % self.kv_head_num != 0 {
            return Err(OpError::invalid_args(format!(
                "attention: head_num {} not a multiple of kv_head_num {}",
                self.head_num, self.kv_head_num
            )));
        }
        if self.rotary_embedding_dim % 2 != 0 || self.rotary_embedding_dim > self.size_per_head {
            return Err(OpError::invalid_args(format!(
                "attention: rotary_embedding_dim {} must be even and <= size_per_head {}",
                self.rotary_embedding_dim, self.size_per_head
            )));
        }
        if self.q_scaling <= 0.0 || !self.q_scaling.is_finite() {
            return Err(OpError::invalid_args("attention: q_scaling must be > 0"));
        }
        Ok(())
    }
}

/// Per-call inputs shared by every attention invocation of a step.
pub struct AttentionCommonInputs<'a, T> {
    pub kv_cache_blocks: &'a mut T,
    pub kv_cache_scales: Option<&'a T>,

    pub input_lengths: &'a T,
    pub sequence_lengths: &'a T,
    pub padding_offset: &'a T,
    pub cu_seqlens: &'a T,

    pub position_ids: Option<&'a T>,
    pub attention_mask: Option<&'a T>,
    pub linear_bias_slopes: Option<&'a T>,
    pub prefix_prompt_lengths: Option<&'a T>,
    /// Shift rotary positions by the prefix prompt length.
    pub count_prefix_length: bool,
    pub max_prefix_length: Option<u32>,

    pub lora_ids: Option<&'a T>,
    pub lora_input_lengths: Option<&'a T>,
}

impl<'a, T: Tensor> AttentionCommonInputs<'a, T> {
    pub fn new(
        kv_cache_blocks: &'a mut T,
        input_lengths: &'a T,
        sequence_lengths: &'a T,
        padding_offset: &'a T,
        cu_seqlens: &'a T,
    ) -> Self {
        Self {
            kv_cache_blocks,
            kv_cache_scales: None,
            input_lengths,
            sequence_lengths,
            padding_offset,
            cu_seqlens,
            position_ids: None,
            attention_mask: None,
            linear_bias_slopes: None,
            prefix_prompt_lengths: None,
            count_prefix_length: false,
            max_prefix_length: None,
            lora_ids: None,
            lora_input_lengths: None,
        }
    }

    #[must_use]
    pub fn with_kv_cache_scales(mut self, scales: &'a T) -> Self {
        self.kv_cache_scales = Some(scales);
        self
    }

    #[must_use]
    pub fn with_position_ids(mut self, ids: &'a T) -> Self {
        self.position_ids = Some(ids);
        self
    }

    #[must_use]
    pub fn with_attention_mask(mut self, mask: &'a T) -> Self {
        self.attention_mask = Some(mask);
        self
    }

    #[must_use]
    pub fn with_linear_bias_slopes(mut self, slopes: &'a T) -> Self {
        self.linear_bias_slopes = Some(slopes);
        self
    }

    #[must_use]
    pub fn with_prefix_prompt(
        mut self,
        lengths: &'a T,
        count_prefix_length: bool,
        max_prefix_length: u32,
    ) -> Self {
        self.prefix_prompt_lengths = Some(lengths);
        self.count_prefix_length = count_prefix_length;
        self.max_prefix_length = Some(max_prefix_length);
        self
    }

    #[must_use]
    pub fn with_lora(mut self, ids: &'a T, input_lengths: &'a T) -> Self {
        self.lora_ids = Some(ids);
        self.lora_input_lengths = Some(input_lengths);
        self
    }

    /// Number of sequences described by the length buffers.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.input_lengths.numel()
    }

    /// Shape checks that need no host access to index values.
    ///
    /// # Errors
    /// `InvalidArgs` on any size or dtype mismatch.
    pub fn validate(&self, configs: &AttentionConfigs, batch: usize, tokens: usize) -> Result<()> {
        expect_numel("input_lengths", self.input_lengths, batch)?;
        expect_index("input_lengths", self.input_lengths)?;
        expect_numel("sequence_lengths", self.sequence_lengths, batch)?;
        expect_index("sequence_lengths", self.sequence_lengths)?;
        expect_numel("cu_seqlens", self.cu_seqlens, batch + 1)?;
        expect_index("cu_seqlens", self.cu_seqlens)?;
        expect_numel("padding_offset", self.padding_offset, tokens)?;
        expect_index("padding_offset", self.padding_offset)?;

        let cache = self.kv_cache_blocks.shape();
        if cache.len() != 5
            || cache[0] != batch
            || cache[1] != 2
            || cache[2] != configs.kv_head_num
            || cache[4] != configs.size_per_head
        {
            return Err(OpError::invalid_args(format!(
                "kv_cache_blocks: expected [{batch}, 2, {}, capacity, {}], got {cache:?}",
                configs.kv_head_num, configs.size_per_head
            )));
        }
        if let Some(scales) = self.kv_cache_scales {
            expect_shape("kv_cache_scales", scales, &[batch, 2, configs.kv_head_num])?;
        }
        if let Some(ids) = self.position_ids {
            expect_numel("position_ids", ids, tokens)?;
            expect_index("position_ids", ids)?;
        }
        if let Some(slopes) = self.linear_bias_slopes {
            expect_numel("linear_bias_slopes", slopes, configs.head_num)?;
        }
        if let Some(prefix) = self.prefix_prompt_lengths {
            expect_numel("prefix_prompt_lengths", prefix, batch)?;
            expect_index("prefix_prompt_lengths", prefix)?;
        }
        match (self.lora_ids, self.lora_input_lengths) {
            (None, None) => {}
            (Some(ids), Some(lengths)) => {
                expect_numel("lora_ids", ids, batch)?;
                expect_index("lora_ids", ids)?;
                expect_numel("lora_input_lengths", lengths, batch)?;
                expect_index("lora_input_lengths", lengths)?;
            }
            _ => {
                return Err(OpError::invalid_args(
                    "lora_ids and lora_input_lengths must be given together",
                ))
            }
        }
        Ok(())
    }
}

/// One invocation of the core attention computation (rotary, cache update,
/// softmax(QK^T)V) over a fused QKV buffer.
pub struct AttentionModuleParams<'p, 'a, T> {
    pub input: &'p T,
    pub output: &'p mut T,

    pub configs: &'p AttentionConfigs,
    pub weights: &'p AttentionLayerWeights<T>,

    pub batch_size: usize,
    pub max_seq_length: usize,

    pub common: &'p mut AttentionCommonInputs<'a, T>,
}

impl<T: Tensor> AttentionModuleParams<'_, '_, T> {
    /// Validate geometry and return the packed token count.
    ///
    /// # Errors
    /// `InvalidArgs` when `batch_size` or `max_seq_length` is zero, or any
    /// buffer disagrees with the configs.
    pub fn validate(&self) -> Result<usize> {
        if self.batch_size == 0 {
            return Err(OpError::invalid_args("attention: batch_size must be > 0"));
        }
        if self.max_seq_length == 0 {
            return Err(OpError::invalid_args(
                "attention: max_seq_length must be > 0",
            ));
        }
        self.configs.validate()?;
        let input = self.input.shape();
        if input.len() != 2 || input[1] != self.configs.qkv_width() {
            return Err(OpError::invalid_args(format!(
                "attention: input must be [tokens, {}], got {input:?}",
                self.configs.qkv_width()
            )));
        }
        let tokens = input[0];
        expect_shape(
            "attention output",
            self.output,
            &[tokens, self.configs.hidden_units()],
        )?;
        if let Some(mask) = self.common.attention_mask {
            expect_numel(
                "attention_mask",
                mask,
                self.batch_size * self.max_seq_length * self.max_seq_length,
            )?;
        }
        self.common
            .validate(self.configs, self.batch_size, tokens)?;
        Ok(tokens)
    }
}

/// One invocation of a full attention layer (projections, attention module,
/// reduction, optional norms).
///
/// Generate-phase sequences come first in the packed layout (one token
/// each), followed by the context-phase sequences.
pub struct AttentionLayerParams<'p, 'a, T> {
    pub input: &'p T,
    pub output: &'p mut T,

    pub weights: &'p AttentionLayerWeights<T>,

    pub generate_batch_size: usize,
    pub max_generate_seq_length: usize,
    pub context_batch_size: usize,
    pub max_context_seq_length: usize,

    pub common: &'p mut AttentionCommonInputs<'a, T>,
}

impl<T: Tensor> AttentionLayerParams<'_, '_, T> {
    /// Total sequences in the call.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.generate_batch_size + self.context_batch_size
    }

    /// Longest sequence across both phases.
    #[must_use]
    pub fn max_seq_length(&self) -> usize {
        self.max_generate_seq_length.max(self.max_context_seq_length)
    }

    /// # Errors
    /// `InvalidArgs` if the input is not 2-D or the output shape differs.
    pub fn validate(&self) -> Result<()> {
        if self.input.ndim() != 2 {
            return Err(OpError::invalid_args(format!(
                "attention layer: input must be [tokens, hidden], got {:?}",
                self.input.shape()
            )));
        }
        expect_shape("attention layer output", self.output, self.input.shape())
    }
}
