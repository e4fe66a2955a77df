//! Tensor parallelism configuration types
//!
//! Describes how attention weights are split across the ranks of a
//! tensor-parallel group. Heads are the unit of splitting: each rank owns a
//! contiguous block of query heads and the matching block of key/value
//! heads.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{OpError, Result};

/// Describes this rank's position in a tensor-parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// This rank (`0..world_size`)
    pub rank: usize,
    /// Total number of ranks in the group
    pub world_size: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self::single()
    }
}

impl ShardConfig {
    /// # Errors
    /// `InvalidArgs` if `world_size == 0` or `rank >= world_size`.
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(OpError::invalid_args(format!(
                "shard: rank {rank} outside group of {world_size}"
            )));
        }
        Ok(Self { rank, world_size })
    }

    /// The unsharded configuration.
    #[must_use]
    pub const fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Compute the shard range for a dimension of size `dim`.
    ///
    /// Returns `(start, shard_size)` where the shard covers
    /// `[start .. start + shard_size)`.
    ///
    /// # Errors
    /// `InvalidArgs` if `dim` is not evenly divisible by `world_size`.
    pub fn shard_range(&self, dim: usize) -> Result<(usize, usize)> {
        if self.world_size == 0 || dim % self.world_size != 0 {
            return Err(OpError::invalid_args(format!(
                "Dimension {dim} is not evenly divisible by world_size {}",
                self.world_size
            )));
        }
        let shard_size = dim / self.world_size;
        Ok((self.rank * shard_size, shard_size))
    }

    /// Columns of a fused `[hidden, (H + 2*KV) * D]` QKV kernel owned by
    /// this rank, as `[q, k, v]` ranges. The local kernel is their
    /// concatenation in that order.
    ///
    /// # Errors
    /// `InvalidArgs` if either head count is not divisible by `world_size`.
    pub fn qkv_column_ranges(
        &self,
        head_num: usize,
        kv_head_num: usize,
        size_per_head: usize,
    ) -> Result<[Range<usize>; 3]> {
        let (q_start, q_heads) = self.shard_range(head_num)?;
        let (kv_start, kv_heads) = self.shard_range(kv_head_num)?;
        let q_cols = head_num * size_per_head;
        let kv_cols = kv_head_num * size_per_head;
        let q = q_start * size_per_head..(q_start + q_heads) * size_per_head;
        let k = q_cols + kv_start * size_per_head..q_cols + (kv_start + kv_heads) * size_per_head;
        let v = q_cols + kv_cols + kv_start * size_per_head
            ..q_cols + kv_cols + (kv_start + kv_heads) * size_per_head;
        Ok([q, k, v])
    }
}

/// How a specific weight tensor is sliced across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStrategy {
    /// Full tensor on every rank (norms, embeddings, LoRA factors feeding a
    /// replicated activation).
    Replicate,
    /// Column-parallel: split along the output dimension. Used for the
    /// fused QKV projection and the FFN up/gate projections. Each rank's
    /// output holds only its heads.
    Column,
    /// Row-parallel: split along the input dimension. Used for the attention
    /// output and FFN down projections. Requires all-reduce after matmul.
    Row,
}

/// Determine the shard strategy for a weight by its slot path in the
/// [`Weights`](crate::weights::Weights) tree, e.g.
/// `layers.3.self_attention_weights.query_weight.kernel`.
///
/// Biases follow their kernel's output dimension: column-parallel biases are
/// split, row-parallel biases are replicated and added once.
#[must_use]
pub fn shard_strategy_for_weight(path: &str) -> ShardStrategy {
    let column = ["query_weight", "intermediate_weight", "intermediate_weight3"];
    let row = ["attention_output_weight", "intermediate_weight2"];

    let mut parts = path.rsplit('.');
    let leaf = parts.next().unwrap_or_default();
    let slot = parts.next().unwrap_or_default();

    match leaf {
        "kernel" | "bias" if column.contains(&slot) => ShardStrategy::Column,
        "kernel" if row.contains(&slot) => ShardStrategy::Row,
        _ => ShardStrategy::Replicate,
    }
}
