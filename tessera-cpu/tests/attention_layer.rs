//! End-to-end tests of the tensor-parallel attention layer on the CPU
//! backend, with ranks running as threads of one process.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

mod test_helpers;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tessera::params::AttentionConfigs;
use tessera::tensor::Tensor;
use tessera::{
    AttentionLayerWeights, Communicator, CustomAllReduce, CustomAllReduceConfig, DType,
    LayerNormWeights, LoraWeights, OpErrorType, Result, SingleRank, TensorParallelAttentionLayer,
};
use tessera_cpu::{CpuBackend, CpuTensor, LocalComm, OneShotAllReduce};
use test_helpers::{
    assert_close, layernorm_rows, matmul, pick_rows, random_vec, LayerFixture, Metadata,
};

const TIMEOUT: Duration = Duration::from_secs(30);

fn fixture() -> LayerFixture {
    LayerFixture::new(7, AttentionConfigs::new(4, 2, 4), 8, &[3, 2])
}

/// Run every rank of a `world_size` group and collect per-rank results.
fn run_group(
    fixture: &LayerFixture,
    world_size: usize,
    custom: bool,
) -> Vec<Result<Vec<f32>>> {
    let comms = LocalComm::group(world_size, TIMEOUT);
    thread::scope(|s| {
        let handles: Vec<_> = comms
            .iter()
            .map(|comm| {
                s.spawn(move || {
                    let one_shot: Option<Arc<dyn CustomAllReduce<CpuTensor>>> = custom.then(|| {
                        Arc::new(OneShotAllReduce::new(comm, CustomAllReduceConfig::default()))
                            as Arc<dyn CustomAllReduce<CpuTensor>>
                    });
                    fixture.run_rank(Arc::new(comm.clone()), one_shot, custom)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn test_single_rank_matches_reference_attention() {
    let f = fixture();
    let out = f.run_rank(Arc::new(SingleRank), None, false).unwrap();
    assert_close(&out, &f.reference(), 1e-4);
}

#[test]
fn test_two_ranks_match_single_rank() {
    let f = fixture().with_post_layernorm(11);
    let single = f.run_rank(Arc::new(SingleRank), None, false).unwrap();
    let results: Vec<Vec<f32>> = run_group(&f, 2, false)
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(results[0], results[1], "ranks must agree bit for bit");
    assert_close(&results[0], &single, 1e-4);
}

#[test]
fn test_custom_all_reduce_matches_generic() {
    let f = fixture();
    let generic: Vec<Vec<f32>> = run_group(&f, 2, false)
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    let custom: Vec<Vec<f32>> = run_group(&f, 2, true)
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(generic, custom);
}

#[test]
fn test_forward_is_repeatable() {
    let f = fixture();
    let layer = f.layer(Arc::new(SingleRank), None, false).unwrap();
    let weights = f.shard_weights(0, 1);
    let input = f.input_tensor();
    let mut meta = f.metadata(1, f.max_seq());

    let first = meta.forward(&layer, &weights, &input, 0).unwrap();
    let second = meta.forward(&layer, &weights, &input, 0).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_group_recovers_after_failed_forward() {
    let f = fixture();
    let comms = LocalComm::group(2, TIMEOUT);
    let results: Vec<(OpErrorType, Vec<f32>)> = thread::scope(|s| {
        let handles: Vec<_> = comms
            .iter()
            .map(|comm| {
                let f = &f;
                s.spawn(move || {
                    let rank = comm.rank();
                    let layer = f.layer(Arc::new(comm.clone()), None, false).unwrap();
                    let weights = f.shard_weights(rank, 2);
                    let input = f.input_tensor();

                    // Rank 1 gets a cache too small for its sequences.
                    let capacity = if rank == 1 { 1 } else { f.max_seq() };
                    let first = f
                        .metadata(2, capacity)
                        .forward(&layer, &weights, &input, 0)
                        .unwrap_err()
                        .error_type();

                    let second = f
                        .metadata(2, f.max_seq())
                        .forward(&layer, &weights, &input, 0)
                        .unwrap();
                    (first, second)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results[0].0, OpErrorType::Internal);
    assert_eq!(results[1].0, OpErrorType::InvalidArgs);
    assert_eq!(results[0].1, results[1].1);
    assert_close(&results[0].1, &f.reference(), 1e-4);
}

#[test]
fn test_mixed_generate_and_context_batch() {
    // Sequence 0 has four tokens, sequence 1 has two.
    let f = LayerFixture::new(7, AttentionConfigs::new(4, 2, 4), 8, &[4, 2]);
    let (hidden, dim) = (f.hidden, f.configs.size_per_head);
    let expected = f.reference();
    let layer = f.layer(Arc::new(SingleRank), None, false).unwrap();
    let weights = f.shard_weights(0, 1);

    // Prefill the first three tokens of sequence 0 next to sequence 1.
    let mut prefill = Metadata::new(&[3, 2], &[0, 0], 2, 4, dim);
    let rows = [0, 1, 2, 4, 5];
    let input = CpuTensor::from_f32(&[rows.len(), hidden], &pick_rows(&f.input, hidden, &rows));
    let out = prefill.forward(&layer, &weights, &input, 0).unwrap();
    assert_close(&out, &pick_rows(&expected, hidden, &rows), 1e-4);

    // Sequence 0 generates its fourth token from the cache while sequence 1
    // is run again as a fresh context.
    let mut mixed = Metadata::new(&[1, 2], &[3, 0], 2, 4, dim);
    mixed.cache = prefill.cache;
    let rows = [3, 4, 5];
    let input = CpuTensor::from_f32(&[rows.len(), hidden], &pick_rows(&f.input, hidden, &rows));
    let out = mixed.forward(&layer, &weights, &input, 1).unwrap();
    assert_close(&out, &pick_rows(&expected, hidden, &rows), 1e-4);
}

#[test]
fn test_pre_layernorms_apply_in_order() {
    let f = fixture();
    let mut rng = StdRng::seed_from_u64(21);
    let gamma1: Vec<f32> = random_vec(&mut rng, f.hidden).iter().map(|g| 1.0 + g).collect();
    let beta1 = random_vec(&mut rng, f.hidden);
    let gamma2: Vec<f32> = random_vec(&mut rng, f.hidden).iter().map(|g| 1.0 + g).collect();

    let mut weights = f.shard_weights(0, 1);
    weights.pre_layernorm = Some(LayerNormWeights {
        gamma: CpuTensor::from_f32(&[f.hidden], &gamma1),
        beta: Some(CpuTensor::from_f32(&[f.hidden], &beta1)),
    });
    weights.pre_attention_layernorm = Some(LayerNormWeights {
        gamma: CpuTensor::from_f32(&[f.hidden], &gamma2),
        beta: None,
    });
    let layer = f.layer(Arc::new(SingleRank), None, false).unwrap();
    let out = f
        .metadata(1, f.max_seq())
        .forward(&layer, &weights, &f.input_tensor(), 0)
        .unwrap();

    let eps = f.layer_config(false).layernorm_eps;
    let mut normed = fixture();
    normed.input = layernorm_rows(
        &layernorm_rows(&f.input, &gamma1, Some(&beta1), eps),
        &gamma2,
        None,
        eps,
    );
    assert_close(&out, &normed.reference(), 1e-4);
}

#[test]
fn test_attention_layernorm_needs_a_single_rank() {
    let f = fixture();
    let comms = LocalComm::group(2, TIMEOUT);
    let errors: Vec<OpErrorType> = thread::scope(|s| {
        let handles: Vec<_> = comms
            .iter()
            .map(|comm| {
                let f = &f;
                s.spawn(move || {
                    let layer = f.layer(Arc::new(comm.clone()), None, false).unwrap();
                    let local = layer.local_configs().hidden_units();
                    let mut weights = f.shard_weights(comm.rank(), 2);
                    weights.attention_layernorm = Some(LayerNormWeights {
                        gamma: CpuTensor::from_f32(&[local], &vec![1.0; local]),
                        beta: None,
                    });
                    f.metadata(2, f.max_seq())
                        .forward(&layer, &weights, &f.input_tensor(), 0)
                        .unwrap_err()
                        .error_type()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(errors, vec![OpErrorType::Unimplemented; 2]);

    let layer = f.layer(Arc::new(SingleRank), None, false).unwrap();
    let width = f.configs.hidden_units();
    let mut weights = f.shard_weights(0, 1);
    weights.attention_layernorm = Some(LayerNormWeights {
        gamma: CpuTensor::from_f32(&[width], &vec![1.0; width]),
        beta: None,
    });
    assert!(f
        .metadata(1, f.max_seq())
        .forward(&layer, &weights, &f.input_tensor(), 0)
        .is_ok());
}

/// Adapter `5` on both projections, applied to sequence 0 only.
struct Adapters {
    /// `[hidden, RANK]`, `[RANK, qkv_width]`
    query: (Vec<f32>, Vec<f32>),
    /// `[head_num * size_per_head, RANK]`, `[RANK, hidden]`
    output: (Vec<f32>, Vec<f32>),
}

const LORA_RANK: usize = 2;

impl Adapters {
    fn new(f: &LayerFixture) -> Self {
        let mut rng = StdRng::seed_from_u64(33);
        let (hidden, width, context) = (f.hidden, f.configs.qkv_width(), f.configs.hidden_units());
        Self {
            query: (
                random_vec(&mut rng, hidden * LORA_RANK),
                random_vec(&mut rng, LORA_RANK * width),
            ),
            output: (
                random_vec(&mut rng, context * LORA_RANK),
                random_vec(&mut rng, LORA_RANK * hidden),
            ),
        }
    }

    /// The fixture with both deltas folded into its kernels.
    fn merged(&self, f: &LayerFixture) -> LayerFixture {
        let (hidden, width, context) = (f.hidden, f.configs.qkv_width(), f.configs.hidden_units());
        let mut merged = fixture();
        let dq = matmul(&self.query.0, &self.query.1, hidden, LORA_RANK, width);
        let dout = matmul(&self.output.0, &self.output.1, context, LORA_RANK, hidden);
        for (k, d) in merged.qkv_kernel.iter_mut().zip(dq) {
            *k += d;
        }
        for (k, d) in merged.out_kernel.iter_mut().zip(dout) {
            *k += d;
        }
        merged
    }

    /// `rank`'s shard of the adapters, attached to its layer weights.
    fn attach(&self, f: &LayerFixture, rank: usize, world_size: usize) -> AttentionLayerWeights<CpuTensor> {
        let (hidden, width, context) = (f.hidden, f.configs.qkv_width(), f.configs.hidden_units());
        let ranges = f.qkv_ranges(rank, world_size);
        let mut weights = f.shard_weights(rank, world_size);
        let adapter = |a, b| {
            HashMap::from([(
                "5".to_string(),
                LoraWeights {
                    a,
                    b,
                    a_scale: None,
                    b_scale: None,
                },
            )])
        };
        weights.query_lora_weights = Some(adapter(
            CpuTensor::from_f32(&[hidden, LORA_RANK], &self.query.0),
            CpuTensor::from_f32(&[LORA_RANK, width], &self.query.1).narrow_cols(&ranges),
        ));
        weights.attention_output_lora_weights = Some(adapter(
            CpuTensor::from_f32(&[context, LORA_RANK], &self.output.0).narrow_rows(ranges[0].clone()),
            CpuTensor::from_f32(&[LORA_RANK, hidden], &self.output.1),
        ));
        weights
    }
}

#[test]
fn test_lora_deltas_follow_adapter_ids_across_ranks() {
    let f = fixture();
    let adapters = Adapters::new(&f);
    let tokens = f.tokens();
    let first = f.lengths[0];
    let with_adapter = adapters.merged(&f).reference();
    let without = f.reference();
    let hidden = f.hidden;
    let mut expected = with_adapter[..first * hidden].to_vec();
    expected.extend_from_slice(&without[first * hidden..tokens * hidden]);

    let run = |comm: Arc<dyn Communicator<CpuTensor>>| {
        let (rank, world_size) = (comm.rank(), comm.world_size());
        let layer = f.layer(comm, None, false).unwrap();
        let weights = adapters.attach(&f, rank, world_size);
        let mut meta = f.metadata(world_size, f.max_seq());
        let lengths: Vec<i32> = f.lengths.iter().map(|&l| l as i32).collect();
        meta.lora = Some((
            CpuTensor::from_i32(&[2], &[5, -1]),
            CpuTensor::from_i32(&[2], &lengths),
        ));
        meta.forward(&layer, &weights, &f.input_tensor(), 0).unwrap()
    };

    assert_close(&run(Arc::new(SingleRank)), &expected, 1e-4);

    let comms = LocalComm::group(2, TIMEOUT);
    let results: Vec<Vec<f32>> = thread::scope(|s| {
        let handles: Vec<_> = comms
            .iter()
            .map(|comm| {
                let run = &run;
                s.spawn(move || run(Arc::new(comm.clone()) as Arc<dyn Communicator<CpuTensor>>))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    // The output bias is added on one rank only, so it appears once.
    assert_eq!(results[0], results[1]);
    assert_close(&results[0], &expected, 1e-4);
}

#[test]
fn test_int8_kv_cache_stores_scaled_values() {
    let f = fixture();
    let c = &f.configs;
    let layer = f.layer(Arc::new(SingleRank), None, false).unwrap();
    let weights = f.shard_weights(0, 1);
    let scale = 1.0 / 64.0;

    let mut meta = f.metadata(1, f.max_seq());
    let cache_shape = meta.cache.shape().to_vec();
    meta.cache = CpuTensor::zeros(&cache_shape, DType::I8);
    meta.kv_scales = Some(CpuTensor::from_f32(
        &[f.lengths.len(), 2, c.kv_head_num],
        &vec![scale; f.lengths.len() * 2 * c.kv_head_num],
    ));
    let out = meta.forward(&layer, &weights, &f.input_tensor(), 0).unwrap();
    assert_close(&out, &f.reference(), 5e-2);

    // First key of sequence 0, kv head 0, sits at the start of the cache.
    let width = c.qkv_width();
    let dim = c.size_per_head;
    let qkv = matmul(&f.input[..f.hidden], &f.qkv_kernel, 1, f.hidden, width);
    let key_start = c.head_num * dim;
    let expected: Vec<f32> = (key_start..key_start + dim)
        .map(|col| ((qkv[col] + f.qkv_bias[col]) / scale).round())
        .collect();
    assert_close(&meta.cache.to_f32_vec()[..dim], &expected, 1.0);

    let mut unscaled = f.metadata(1, f.max_seq());
    unscaled.cache = CpuTensor::zeros(&cache_shape, DType::I8);
    let err = unscaled
        .forward(&layer, &weights, &f.input_tensor(), 0)
        .unwrap_err();
    assert_eq!(err.error_type(), OpErrorType::InvalidArgs);
}

#[test]
fn test_heads_must_split_evenly() {
    let f = LayerFixture::new(3, AttentionConfigs::new(3, 3, 4), 8, &[2]);
    let comms = LocalComm::group(2, TIMEOUT);
    let err = TensorParallelAttentionLayer::<CpuBackend>::new(
        &f.layer_config(false),
        Arc::new(comms[0].clone()) as Arc<dyn Communicator<CpuTensor>>,
        None,
    )
    .err()
    .unwrap();
    assert_eq!(err.error_type(), OpErrorType::InvalidArgs);
}
