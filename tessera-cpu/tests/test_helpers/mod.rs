//! Shared fixtures for the CPU integration tests.
//!
//! Provides a small attention layer with random weights, the per-rank head
//! shards of those weights, the packed-batch metadata buffers, and a plain
//! host reference of causal scaled-dot-product attention.

#![allow(
    dead_code,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss
)]

use std::ops::Range;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera::params::{AttentionCommonInputs, AttentionConfigs, AttentionLayerParams};
use tessera::{
    AttentionLayerConfig, AttentionLayerWeights, Communicator, CustomAllReduce, DType,
    DenseWeights, LayerNormWeights, Result, ShardConfig, Tensor, TensorParallelAttentionLayer,
};
use tessera_cpu::{CpuBackend, CpuTensor};

pub fn random_vec(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-0.5f32..0.5)).collect()
}

pub fn assert_close(got: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (i, (g, e)) in got.iter().zip(expected).enumerate() {
        assert!(
            (g - e).abs() <= tol,
            "element {i}: got {g}, expected {e} (tol {tol})"
        );
    }
}

/// Index buffers describing one packed batch of new tokens, plus the
/// optional per-call extras the tests switch on.
pub struct Metadata {
    /// New tokens per sequence, generate-phase sequences first.
    pub lengths: Vec<usize>,
    pub cache: CpuTensor,
    pub input_lengths: CpuTensor,
    pub sequence_lengths: CpuTensor,
    pub padding_offset: CpuTensor,
    pub cu_seqlens: CpuTensor,
    pub kv_scales: Option<CpuTensor>,
    /// `(lora_ids, lora_input_lengths)`
    pub lora: Option<(CpuTensor, CpuTensor)>,
}

impl Metadata {
    /// Metadata for sequences with `lengths` new tokens on top of `past`
    /// cached ones, with a zeroed `[batch, 2, kv_heads, capacity, dim]`
    /// cache.
    pub fn new(
        lengths: &[usize],
        past: &[usize],
        kv_heads: usize,
        capacity: usize,
        dim: usize,
    ) -> Self {
        let batch = lengths.len();
        let max_seq = lengths.iter().copied().max().unwrap_or(0);
        let mut cu = vec![0i32];
        let mut padding = Vec::new();
        for (i, &len) in lengths.iter().enumerate() {
            let start = *cu.last().unwrap() as usize;
            for j in 0..len {
                padding.push((i * max_seq + j - (start + j)) as i32);
            }
            cu.push((start + len) as i32);
        }
        let to_i32 = |v: &[usize]| v.iter().map(|&x| x as i32).collect::<Vec<_>>();
        Self {
            lengths: lengths.to_vec(),
            cache: CpuTensor::zeros(&[batch, 2, kv_heads, capacity, dim], DType::F32),
            input_lengths: CpuTensor::from_i32(&[batch], &to_i32(lengths)),
            sequence_lengths: CpuTensor::from_i32(&[batch], &to_i32(past)),
            padding_offset: CpuTensor::from_i32(&[padding.len()], &padding),
            cu_seqlens: CpuTensor::from_i32(&[batch + 1], &cu),
            kv_scales: None,
            lora: None,
        }
    }

    /// Metadata for a first call: nothing cached yet.
    pub fn prefill(lengths: &[usize], kv_heads: usize, capacity: usize, dim: usize) -> Self {
        Self::new(lengths, &vec![0; lengths.len()], kv_heads, capacity, dim)
    }

    pub fn common(&mut self) -> AttentionCommonInputs<'_, CpuTensor> {
        let mut common = AttentionCommonInputs::new(
            &mut self.cache,
            &self.input_lengths,
            &self.sequence_lengths,
            &self.padding_offset,
            &self.cu_seqlens,
        );
        if let Some(scales) = &self.kv_scales {
            common = common.with_kv_cache_scales(scales);
        }
        if let Some((ids, lengths)) = &self.lora {
            common = common.with_lora(ids, lengths);
        }
        common
    }

    /// Run `layer` over `input`, treating the first `generate_batch_size`
    /// sequences as the generate phase and the rest as context.
    pub fn forward(
        &mut self,
        layer: &TensorParallelAttentionLayer<CpuBackend>,
        weights: &AttentionLayerWeights<CpuTensor>,
        input: &CpuTensor,
        generate_batch_size: usize,
    ) -> Result<Vec<f32>> {
        let (generate, context) = self.lengths.split_at(generate_batch_size);
        let max_of = |l: &[usize]| l.iter().copied().max().unwrap_or(0);
        let max_generate_seq_length = max_of(generate);
        let max_context_seq_length = max_of(context);
        let context_batch_size = context.len();

        let mut output = CpuTensor::zeros(input.shape(), DType::F32);
        let mut common = self.common();
        layer.forward(AttentionLayerParams {
            input,
            output: &mut output,
            weights,
            generate_batch_size,
            max_generate_seq_length,
            context_batch_size,
            max_context_seq_length,
            common: &mut common,
        })?;
        Ok(output.to_f32_vec())
    }
}

/// A whole-model attention layer with random weights.
pub struct LayerFixture {
    pub configs: AttentionConfigs,
    pub hidden: usize,
    pub lengths: Vec<usize>,
    /// `[tokens, hidden]`
    pub input: Vec<f32>,
    /// `[hidden, qkv_width]`
    pub qkv_kernel: Vec<f32>,
    /// `[qkv_width]`
    pub qkv_bias: Vec<f32>,
    /// `[head_num * size_per_head, hidden]`
    pub out_kernel: Vec<f32>,
    /// `[hidden]`
    pub out_bias: Vec<f32>,
    pub post_gamma: Option<Vec<f32>>,
}

impl LayerFixture {
    pub fn new(seed: u64, configs: AttentionConfigs, hidden: usize, lengths: &[usize]) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let tokens: usize = lengths.iter().sum();
        let width = configs.qkv_width();
        let context = configs.hidden_units();
        Self {
            input: random_vec(&mut rng, tokens * hidden),
            qkv_kernel: random_vec(&mut rng, hidden * width),
            qkv_bias: random_vec(&mut rng, width),
            out_kernel: random_vec(&mut rng, context * hidden),
            out_bias: random_vec(&mut rng, hidden),
            post_gamma: None,
            configs,
            hidden,
            lengths: lengths.to_vec(),
        }
    }

    #[must_use]
    pub fn with_post_layernorm(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.post_gamma = Some(
            random_vec(&mut rng, self.hidden)
                .into_iter()
                .map(|g| 1.0 + g)
                .collect(),
        );
        self
    }

    pub fn tokens(&self) -> usize {
        self.lengths.iter().sum()
    }

    pub fn max_seq(&self) -> usize {
        self.lengths.iter().copied().max().unwrap_or(0)
    }

    pub fn input_tensor(&self) -> CpuTensor {
        CpuTensor::from_f32(&[self.tokens(), self.hidden], &self.input)
    }

    pub fn layer_config(&self, custom_all_reduce: bool) -> AttentionLayerConfig {
        AttentionLayerConfig {
            attention: self.configs.clone(),
            enable_custom_all_reduce: custom_all_reduce,
            ..AttentionLayerConfig::default()
        }
    }

    /// Column ranges of `rank`'s q, k and v heads in the fused QKV width.
    pub fn qkv_ranges(&self, rank: usize, world_size: usize) -> [Range<usize>; 3] {
        let c = &self.configs;
        ShardConfig::new(rank, world_size)
            .unwrap()
            .qkv_column_ranges(c.head_num, c.kv_head_num, c.size_per_head)
            .unwrap()
    }

    /// Weights held by `rank` of a `world_size`-way head split: the rank's
    /// q/k/v columns of the fused kernel and the matching rows of the
    /// output kernel.
    pub fn shard_weights(&self, rank: usize, world_size: usize) -> AttentionLayerWeights<CpuTensor> {
        let c = &self.configs;
        let ranges = self.qkv_ranges(rank, world_size);
        let width = c.qkv_width();
        let qkv = CpuTensor::from_f32(&[self.hidden, width], &self.qkv_kernel).narrow_cols(&ranges);
        let bias = CpuTensor::from_f32(&[1, width], &self.qkv_bias).narrow_cols(&ranges);
        let out = CpuTensor::from_f32(&[c.hidden_units(), self.hidden], &self.out_kernel)
            .narrow_rows(ranges[0].clone());
        let mut weights = AttentionLayerWeights::new(
            DenseWeights::new(qkv).with_bias(bias),
            DenseWeights::new(out).with_bias(CpuTensor::from_f32(&[self.hidden], &self.out_bias)),
        );
        weights.post_layernorm = self.post_gamma.as_ref().map(|g| LayerNormWeights {
            gamma: CpuTensor::from_f32(&[self.hidden], g),
            beta: None,
        });
        weights
    }

    /// Fresh metadata sized for the local head shard of a `world_size` split.
    pub fn metadata(&self, world_size: usize, capacity: usize) -> Metadata {
        Metadata::prefill(
            &self.lengths,
            self.configs.kv_head_num / world_size,
            capacity,
            self.configs.size_per_head,
        )
    }

    pub fn layer(
        &self,
        comm: Arc<dyn Communicator<CpuTensor>>,
        custom: Option<Arc<dyn CustomAllReduce<CpuTensor>>>,
        enable_custom: bool,
    ) -> Result<TensorParallelAttentionLayer<CpuBackend>> {
        TensorParallelAttentionLayer::new(&self.layer_config(enable_custom), comm, custom)
    }

    /// Run one rank of the layer over a fresh cache and return its output.
    pub fn run_rank(
        &self,
        comm: Arc<dyn Communicator<CpuTensor>>,
        custom: Option<Arc<dyn CustomAllReduce<CpuTensor>>>,
        enable_custom: bool,
    ) -> Result<Vec<f32>> {
        let world_size = comm.world_size();
        let rank = comm.rank();
        let layer = self.layer(comm, custom, enable_custom)?;
        let weights = self.shard_weights(rank, world_size);
        let mut meta = self.metadata(world_size, self.max_seq());
        meta.forward(&layer, &weights, &self.input_tensor(), 0)
    }

    /// Host reference: biased QKV projection, causal softmax attention with
    /// grouped KV heads, biased output projection. No rotary, no norms.
    pub fn reference(&self) -> Vec<f32> {
        let c = &self.configs;
        let (heads, kv_heads, dim) = (c.head_num, c.kv_head_num, c.size_per_head);
        let width = c.qkv_width();
        let tokens = self.tokens();
        let qkv = matmul(&self.input, &self.qkv_kernel, tokens, self.hidden, width);
        let qkv: Vec<f32> = qkv
            .chunks(width)
            .flat_map(|row| row.iter().zip(&self.qkv_bias).map(|(v, b)| v + b))
            .collect();
        let scale = c.softmax_scale();
        let q_of = |t: usize, h: usize| &qkv[t * width + h * dim..t * width + (h + 1) * dim];
        let k_of = |t: usize, kv: usize| {
            &qkv[t * width + (heads + kv) * dim..t * width + (heads + kv + 1) * dim]
        };
        let v_of = |t: usize, kv: usize| {
            &qkv[t * width + (heads + kv_heads + kv) * dim
                ..t * width + (heads + kv_heads + kv + 1) * dim]
        };

        let mut context = vec![0.0f32; tokens * heads * dim];
        let mut start = 0;
        for &len in &self.lengths {
            for j in 0..len {
                for h in 0..heads {
                    let kv = h / (heads / kv_heads);
                    let q = q_of(start + j, h);
                    let scores: Vec<f32> = (0..=j)
                        .map(|p| dot(q, k_of(start + p, kv)) * scale)
                        .collect();
                    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
                    let sum: f32 = exps.iter().sum();
                    let out = &mut context
                        [((start + j) * heads + h) * dim..((start + j) * heads + h + 1) * dim];
                    for (p, e) in exps.iter().enumerate() {
                        for (o, v) in out.iter_mut().zip(v_of(start + p, kv)) {
                            *o += e / sum * v;
                        }
                    }
                }
            }
            start += len;
        }

        let out = matmul(&context, &self.out_kernel, tokens, heads * dim, self.hidden);
        out.chunks(self.hidden)
            .flat_map(|row| row.iter().zip(&self.out_bias).map(|(v, b)| v + b))
            .collect()
    }
}

/// The given rows of a row-major matrix `width` wide.
pub fn pick_rows(values: &[f32], width: usize, rows: &[usize]) -> Vec<f32> {
    rows.iter()
        .flat_map(|&r| values[r * width..(r + 1) * width].iter().copied())
        .collect()
}

/// Host layernorm of every `gamma.len()`-wide row.
pub fn layernorm_rows(x: &[f32], gamma: &[f32], beta: Option<&[f32]>, eps: f32) -> Vec<f32> {
    let n = gamma.len() as f32;
    x.chunks(gamma.len())
        .flat_map(|row| {
            let mean = row.iter().sum::<f32>() / n;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
            let inv = 1.0 / (var + eps).sqrt();
            row.iter()
                .enumerate()
                .map(move |(i, v)| (v - mean) * inv * gamma[i] + beta.map_or(0.0, |b| b[i]))
                .collect::<Vec<_>>()
        })
        .collect()
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Row-major `[m, k] x [k, n]`.
pub fn matmul(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for p in 0..k {
            let av = a[i * k + p];
            for j in 0..n {
                out[i * n + j] += av * b[p * n + j];
            }
        }
    }
    out
}
