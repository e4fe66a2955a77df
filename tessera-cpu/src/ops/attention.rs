//! AttentionOps implementation for CpuBackend.
//!
//! Each sequence owns one contiguous block of the KV cache
//! (`[2, KV, capacity, D]`), so sequences are processed in parallel over
//! cache blocks. Within a sequence, new keys/values are written into the
//! cache first, then every new query attends causally over the cache.

#![allow(clippy::cast_precision_loss)]

use rayon::prelude::*;
use tessera::backend::AttentionOps;
use tessera::dtype::DType;
use tessera::params::{AttentionConfigs, AttentionModuleParams};
use tessera::rope::{apply_rotary, logn_scale, rotary_cos_sin};
use tessera::tensor::Tensor;
use tessera::{OpError, Result};
use tracing::trace;

use super::read_counts;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// Host view of one packed sequence.
#[derive(Debug, Clone, Copy)]
struct SeqLayout {
    /// First packed row.
    start: usize,
    /// New tokens in this call.
    new: usize,
    /// Tokens already cached, excluding the prefix prompt.
    past: usize,
    prefix: usize,
}

impl SeqLayout {
    /// Cache slot of the `j`-th new token.
    fn slot(self, j: usize) -> usize {
        self.prefix + self.past + j
    }

    fn total(self) -> usize {
        self.prefix + self.past + self.new
    }
}

/// Host-side metadata of one call, checked against each other.
struct Plan {
    seqs: Vec<SeqLayout>,
    position_ids: Option<Vec<usize>>,
    capacity: usize,
}

fn plan(params: &AttentionModuleParams<'_, '_, CpuTensor>, tokens: usize) -> Result<Plan> {
    let common = &*params.common;
    let batch = params.batch_size;
    let max_seq = params.max_seq_length;

    let input_lengths = read_counts("input_lengths", common.input_lengths)?;
    let sequence_lengths = read_counts("sequence_lengths", common.sequence_lengths)?;
    let cu_seqlens = read_counts("cu_seqlens", common.cu_seqlens)?;
    let padding_offset = read_counts("padding_offset", common.padding_offset)?;
    let prefix = match common.prefix_prompt_lengths {
        Some(p) => read_counts("prefix_prompt_lengths", p)?,
        None => vec![0; batch],
    };
    let capacity = common.kv_cache_blocks.shape()[3];

    if cu_seqlens[0] != 0 || cu_seqlens[batch] != tokens {
        return Err(OpError::invalid_args(format!(
            "attention: cu_seqlens must run from 0 to {tokens}, got {cu_seqlens:?}"
        )));
    }
    let mut seqs = Vec::with_capacity(batch);
    for i in 0..batch {
        let seq = SeqLayout {
            start: cu_seqlens[i],
            new: input_lengths[i],
            past: sequence_lengths[i],
            prefix: prefix[i],
        };
        if cu_seqlens[i + 1] != seq.start + seq.new {
            return Err(OpError::invalid_args(format!(
                "attention: cu_seqlens {cu_seqlens:?} disagrees with input_lengths {input_lengths:?}"
            )));
        }
        if seq.new > max_seq {
            return Err(OpError::invalid_args(format!(
                "attention: sequence {i} has {} new tokens, max_seq_length is {max_seq}",
                seq.new
            )));
        }
        if let Some(max_prefix) = common.max_prefix_length {
            if seq.prefix > max_prefix as usize {
                return Err(OpError::invalid_args(format!(
                    "attention: prefix length {} exceeds max_prefix_length {max_prefix}",
                    seq.prefix
                )));
            }
        }
        if seq.total() > capacity {
            return Err(OpError::invalid_args(format!(
                "attention: sequence {i} needs {} cache slots, capacity is {capacity}",
                seq.total()
            )));
        }
        for j in 0..seq.new {
            let t = seq.start + j;
            if padding_offset[t] + t != i * max_seq + j {
                return Err(OpError::invalid_args(format!(
                    "attention: padding_offset[{t}] = {} inconsistent with sequence {i}",
                    padding_offset[t]
                )));
            }
        }
        seqs.push(seq);
    }

    let position_ids = common
        .position_ids
        .map(|p| read_counts("position_ids", p))
        .transpose()?;
    Ok(Plan {
        seqs,
        position_ids,
        capacity,
    })
}

/// Read-only inputs shared by every sequence of the call.
struct Shared<'a> {
    configs: &'a AttentionConfigs,
    qkv: &'a [f32],
    /// `[batch, 2, KV]`
    kv_scales: Option<&'a [f32]>,
    /// `[H]`
    slopes: Option<&'a [f32]>,
    /// `[batch, S, S]`
    mask: Option<&'a [f32]>,
    position_ids: Option<&'a [usize]>,
    count_prefix_length: bool,
    max_seq: usize,
    capacity: usize,
    quantized_cache: bool,
}

impl Shared<'_> {
    fn kv_scale(&self, seq: usize, which: usize, kv: usize) -> f32 {
        let kv_heads = self.configs.kv_head_num;
        self.kv_scales
            .map_or(1.0, |s| s[(seq * 2 + which) * kv_heads + kv])
    }

    fn store(&self, value: f32, scale: f32) -> f32 {
        let v = value / scale;
        if self.quantized_cache {
            v.round().clamp(-128.0, 127.0)
        } else {
            v
        }
    }

    /// Attention of every new token of sequence `i`. Writes new K/V into
    /// `cache` and returns the `[new, H * D]` context rows.
    #[allow(clippy::needless_range_loop, clippy::float_cmp)]
    fn sequence(&self, i: usize, seq: SeqLayout, cache: &mut [f32]) -> Vec<f32> {
        let c = self.configs;
        let (heads, kv_heads, dim) = (c.head_num, c.kv_head_num, c.size_per_head);
        let width = c.qkv_width();
        let layout = c.position_embedding_style.layout();
        let gqa_ratio = heads / kv_heads;
        let cache_index = |which: usize, kv: usize, slot: usize| {
            ((which * kv_heads + kv) * self.capacity + slot) * dim
        };

        let mut queries = vec![0.0f32; seq.new * heads * dim];
        for j in 0..seq.new {
            let t = seq.start + j;
            let row = &self.qkv[t * width..(t + 1) * width];
            let pos = match self.position_ids {
                Some(ids) => ids[t],
                None if self.count_prefix_length => seq.prefix + seq.past + j,
                None => seq.past + j,
            };
            let cos_sin = rotary_cos_sin(c, pos, seq.total());
            let q_scale = logn_scale(c, pos);

            for h in 0..heads {
                let q = &mut queries[(j * heads + h) * dim..(j * heads + h + 1) * dim];
                q.copy_from_slice(&row[h * dim..(h + 1) * dim]);
                apply_rotary(q, &cos_sin, layout);
                for v in q.iter_mut() {
                    *v *= q_scale;
                }
            }
            for kv in 0..kv_heads {
                let mut k = row[(heads + kv) * dim..(heads + kv + 1) * dim].to_vec();
                apply_rotary(&mut k, &cos_sin, layout);
                let v = &row[(heads + kv_heads + kv) * dim..(heads + kv_heads + kv + 1) * dim];
                let (k_scale, v_scale) = (self.kv_scale(i, 0, kv), self.kv_scale(i, 1, kv));
                let k_at = cache_index(0, kv, seq.slot(j));
                let v_at = cache_index(1, kv, seq.slot(j));
                for d in 0..dim {
                    cache[k_at + d] = self.store(k[d], k_scale);
                    cache[v_at + d] = self.store(v[d], v_scale);
                }
            }
        }

        let softmax_scale = c.softmax_scale();
        let mut output = vec![0.0f32; seq.new * heads * dim];
        let mut scores = Vec::with_capacity(seq.total());
        for j in 0..seq.new {
            let query_pos = seq.slot(j);
            for h in 0..heads {
                let kv = h / gqa_ratio;
                let (k_scale, v_scale) = (self.kv_scale(i, 0, kv), self.kv_scale(i, 1, kv));
                let q = &queries[(j * heads + h) * dim..(j * heads + h + 1) * dim];

                scores.clear();
                for key_pos in 0..=query_pos {
                    let k = &cache[cache_index(0, kv, key_pos)..cache_index(0, kv, key_pos) + dim];
                    let mut score =
                        q.iter().zip(k).map(|(a, b)| a * b).sum::<f32>() * k_scale * softmax_scale;
                    if let Some(slopes) = self.slopes {
                        score += slopes[h] * (key_pos as f32 - query_pos as f32);
                    }
                    if let Some(mask) = self.mask {
                        if let Some(jk) = key_pos.checked_sub(seq.prefix + seq.past) {
                            let m = mask[(i * self.max_seq + j) * self.max_seq + jk];
                            if m == 0.0 {
                                score = f32::NEG_INFINITY;
                            }
                        }
                    }
                    scores.push(score);
                }

                let max_score = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                if max_score == f32::NEG_INFINITY {
                    continue;
                }
                let mut sum = 0.0f32;
                for score in &mut scores {
                    *score = (*score - max_score).exp();
                    sum += *score;
                }

                let o = &mut output[(j * heads + h) * dim..(j * heads + h + 1) * dim];
                for (key_pos, &p) in scores.iter().enumerate() {
                    if p == 0.0 {
                        continue;
                    }
                    let v_at = cache_index(1, kv, key_pos);
                    let weight = p / sum * v_scale;
                    for d in 0..dim {
                        o[d] += weight * cache[v_at + d];
                    }
                }
            }
        }
        output
    }
}

impl AttentionOps for CpuBackend {
    fn attention_module(params: AttentionModuleParams<'_, '_, CpuTensor>) -> Result<()> {
        let tokens = params.validate()?;
        let plan = plan(&params, tokens)?;
        let configs = params.configs;
        trace!(
            batch = params.batch_size,
            tokens,
            heads = configs.head_num,
            kv_heads = configs.kv_head_num,
            "attention_module"
        );
        if tokens == 0 {
            return Ok(());
        }

        let mut qkv = params.input.to_f32_vec();
        if let Some(bias) = &params.weights.query_weight.bias {
            let bias = bias.to_f32_vec();
            if bias.len() != configs.qkv_width() {
                return Err(OpError::invalid_args(format!(
                    "attention: qkv bias has {} elements, expected {}",
                    bias.len(),
                    configs.qkv_width()
                )));
            }
            for row in qkv.chunks_mut(bias.len()) {
                for (v, b) in row.iter_mut().zip(&bias) {
                    *v += b;
                }
            }
        }

        let common = &mut *params.common;
        let kv_scales = common.kv_cache_scales.map(CpuTensor::to_f32_vec);
        let slopes = common.linear_bias_slopes.map(CpuTensor::to_f32_vec);
        let mask = common.attention_mask.map(CpuTensor::to_f32_vec);
        let quantized_cache = common.kv_cache_blocks.dtype() == DType::I8;
        if quantized_cache && kv_scales.is_none() {
            return Err(OpError::invalid_args(
                "attention: int8 kv cache requires kv_cache_scales",
            ));
        }
        let shared = Shared {
            configs,
            qkv: &qkv,
            kv_scales: kv_scales.as_deref(),
            slopes: slopes.as_deref(),
            mask: mask.as_deref(),
            position_ids: plan.position_ids.as_deref(),
            count_prefix_length: common.count_prefix_length,
            max_seq: params.max_seq_length,
            capacity: plan.capacity,
            quantized_cache,
        };

        let mut cache = common.kv_cache_blocks.to_f32_vec();
        let block = cache.len() / params.batch_size;
        let context: Vec<Vec<f32>> = cache
            .par_chunks_mut(block)
            .zip(plan.seqs.par_iter())
            .enumerate()
            .map(|(i, (seq_cache, &seq))| shared.sequence(i, seq, seq_cache))
            .collect();

        common.kv_cache_blocks.write_f32(&cache);
        params.output.write_f32(&context.concat());
        Ok(())
    }
}
