//! Tensor-parallel attention layer.
//!
//! Each rank holds a column shard of the fused QKV kernel (its heads) and
//! the matching row shard of the output kernel. A forward call runs
//!
//! 1. optional input norms,
//! 2. QKV projection plus per-request LoRA deltas,
//! 3. the attention module over this rank's heads,
//! 4. the output projection (partial sums),
//! 5. an all-reduce across the group,
//! 6. optional post layernorm,
//!
//! and leaves the full, rank-identical result in the caller's output buffer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::OpProvider;
use crate::comm::{Communicator, CustomAllReduce};
use crate::error::{OpError, Result};
use crate::params::{
    AllReduceParams, AttentionConfigs, AttentionLayerParams, AttentionModuleParams, CopyParams,
    GemmParams, LayerNormOpType, LayernormParams,
};
use crate::tensor::Tensor;
use crate::lora::{apply_lora, request_spans, LoraSpan};
use crate::weights::LayerNormWeights;

/// Static configuration of an attention layer, in whole-model terms.
///
/// Head counts are those of the unsharded model; each rank derives its own
/// share from the communicator's group size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionLayerConfig {
    pub attention: AttentionConfigs,
    pub norm_type: LayerNormOpType,
    pub layernorm_eps: f32,
    /// Route the reduction through the custom all-reduce when it is
    /// eligible for the call.
    pub enable_custom_all_reduce: bool,
}

impl Default for AttentionLayerConfig {
    fn default() -> Self {
        Self {
            attention: AttentionConfigs::default(),
            norm_type: LayerNormOpType::Layernorm,
            layernorm_eps: 1e-5,
            enable_custom_all_reduce: false,
        }
    }
}

impl AttentionLayerConfig {
    /// Parse and validate a JSON configuration.
    ///
    /// # Errors
    /// `InvalidArgs` for malformed JSON or invalid attention geometry.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.attention.validate()?;
        Ok(config)
    }
}

/// One attention layer bound to a rank of a tensor-parallel group.
pub struct TensorParallelAttentionLayer<B: OpProvider> {
    configs: AttentionConfigs,
    norm_type: LayerNormOpType,
    layernorm_eps: f32,
    comm: Arc<dyn Communicator<B::Tensor>>,
    custom_all_reduce: Option<Arc<dyn CustomAllReduce<B::Tensor>>>,
    enable_custom_all_reduce: bool,
}

impl<B: OpProvider> TensorParallelAttentionLayer<B> {
    /// # Errors
    /// `InvalidArgs` if the head counts cannot be split across the group or
    /// the attention geometry is invalid.
    pub fn new(
        config: &AttentionLayerConfig,
        comm: Arc<dyn Communicator<B::Tensor>>,
        custom_all_reduce: Option<Arc<dyn CustomAllReduce<B::Tensor>>>,
    ) -> Result<Self> {
        config.attention.validate()?;
        let configs = config.attention.shard(comm.world_size())?;
        Ok(Self {
            configs,
            norm_type: config.norm_type,
            layernorm_eps: config.layernorm_eps,
            comm,
            custom_all_reduce,
            enable_custom_all_reduce: config.enable_custom_all_reduce,
        })
    }

    /// Attention configs of this rank's head shard.
    #[must_use]
    pub fn local_configs(&self) -> &AttentionConfigs {
        &self.configs
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    #[must_use]
    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    /// Run the layer. On return `params.output` holds the reduced result on
    /// every rank.
    ///
    /// # Errors
    /// The first failing step's error. A rank failing before the reduction
    /// aborts that reduction round, so its peers fail with `Internal`
    /// instead of waiting forever. The group stays usable for the next
    /// call.
    pub fn forward(&self, mut params: AttentionLayerParams<'_, '_, B::Tensor>) -> Result<()> {
        let world_size = self.world_size();
        if let Err(e) = self.local_forward(&mut params) {
            if world_size > 1 {
                warn!(rank = self.rank(), error = %e, "attention layer failed before reduction");
                self.comm.abort(e.message());
            }
            return Err(e);
        }

        let output = params.output;
        if world_size > 1 {
            self.all_reduce(output)?;
        }

        if let Some(ln) = &params.weights.post_layernorm {
            debug!(rank = self.rank(), "post layernorm");
            let mut normed = B::allocate(output.shape(), output.dtype())?;
            B::layernorm(self.norm_params(&*output, ln, &mut normed))?;
            B::copy(CopyParams::new(&normed, output))?;
        }
        Ok(())
    }

    /// Everything up to and including the output projection.
    fn local_forward(&self, params: &mut AttentionLayerParams<'_, '_, B::Tensor>) -> Result<()> {
        params.validate()?;
        let weights = params.weights;
        let rank = self.rank();
        let world_size = self.world_size();
        if weights.attention_layernorm.is_some() && world_size > 1 {
            return Err(OpError::unimplemented(
                "attention layernorm on a head-sharded context",
            ));
        }

        let tokens = params.input.shape()[0];
        let dtype = params.input.dtype();
        let lora_spans = self.lora_spans(params)?;

        // Input norms.
        let mut x = params.input.clone();
        for ln in [&weights.pre_layernorm, &weights.pre_attention_layernorm]
            .into_iter()
            .flatten()
        {
            let mut normed = B::allocate(x.shape(), dtype)?;
            B::layernorm(self.norm_params(&x, ln, &mut normed))?;
            x = normed;
        }

        debug!(rank, world_size, tokens, "qkv projection");
        let mut qkv = B::allocate(&[tokens, self.configs.qkv_width()], dtype)?;
        B::gemm(GemmParams::new(&x, &weights.query_weight.kernel, &mut qkv))?;
        if let Some(spans) = &lora_spans {
            apply_lora::<B>(&x, weights.query_lora_weights.as_ref(), &mut qkv, spans)?;
        }

        debug!(
            rank,
            batch = params.generate_batch_size + params.context_batch_size,
            "attention module"
        );
        let mut context = B::allocate(&[tokens, self.configs.hidden_units()], dtype)?;
        B::attention_module(AttentionModuleParams {
            input: &qkv,
            output: &mut context,
            configs: &self.configs,
            weights,
            batch_size: params.batch_size(),
            max_seq_length: params.max_seq_length(),
            common: &mut *params.common,
        })?;

        if let Some(ln) = &weights.attention_layernorm {
            let mut normed = B::allocate(context.shape(), dtype)?;
            B::layernorm(self.norm_params(&context, ln, &mut normed))?;
            context = normed;
        }

        debug!(rank, "output projection");
        let out_proj = &weights.attention_output_weight;
        B::gemm(GemmParams::new(&context, &out_proj.kernel, &mut *params.output))?;
        if let Some(spans) = &lora_spans {
            apply_lora::<B>(
                &context,
                weights.attention_output_lora_weights.as_ref(),
                &mut *params.output,
                spans,
            )?;
        }
        if let (0, Some(bias)) = (rank, &out_proj.bias) {
            add_row_bias::<B>(&mut *params.output, bias)?;
        }
        Ok(())
    }

    fn all_reduce(&self, output: &mut B::Tensor) -> Result<()> {
        let world_size = self.world_size();
        let bytes = output.size_in_bytes();
        let buffers = AllReduceParams::new(std::slice::from_mut(output));
        let result = match &self.custom_all_reduce {
            Some(custom) if self.enable_custom_all_reduce && custom.is_eligible(world_size, bytes) => {
                debug!(rank = self.rank(), bytes, "custom all-reduce");
                custom.all_reduce(buffers)
            }
            _ => {
                debug!(rank = self.rank(), bytes, "all-reduce");
                self.comm.all_reduce(buffers)
            }
        };
        if let Err(e) = &result {
            warn!(rank = self.rank(), error = %e, "all-reduce failed");
        }
        result
    }

    fn norm_params<'a>(
        &self,
        input: &'a B::Tensor,
        weights: &'a LayerNormWeights<B::Tensor>,
        output: &'a mut B::Tensor,
    ) -> LayernormParams<'a, B::Tensor> {
        let params = LayernormParams::new(
            self.norm_type,
            input,
            &weights.gamma,
            self.layernorm_eps,
            output,
        );
        match &weights.beta {
            Some(beta) => params.with_beta(beta),
            None => params,
        }
    }

    /// Per-request row spans, or `None` when the call carries no adapter
    /// ids.
    fn lora_spans(
        &self,
        params: &AttentionLayerParams<'_, '_, B::Tensor>,
    ) -> Result<Option<Vec<LoraSpan>>> {
        let common = &*params.common;
        let (Some(ids), Some(lengths)) = (common.lora_ids, common.lora_input_lengths) else {
            return Ok(None);
        };
        let lengths = B::to_index_vec(lengths)?;
        let input_lengths = B::to_index_vec(common.input_lengths)?;
        if lengths != input_lengths {
            return Err(OpError::invalid_args(format!(
                "lora_input_lengths {lengths:?} must match input_lengths {input_lengths:?}"
            )));
        }
        let ids = B::to_index_vec(ids)?;
        request_spans(&ids, &lengths, params.input.shape()[0]).map(Some)
    }
}

/// `output[r, :] += bias` for every row, as a rank-1 update.
fn add_row_bias<B: OpProvider>(output: &mut B::Tensor, bias: &B::Tensor) -> Result<()> {
    let rows = output.rows();
    let ones = B::from_f32_slice(&[rows, 1], output.dtype(), &vec![1.0; rows])?;
    let bias = bias.reshape(&[1, bias.numel()]);
    B::gemm(GemmParams::new(&ones, &bias, output).beta(1.0))
}
