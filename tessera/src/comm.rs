//! Collective communication seam.
//!
//! A tensor-parallel group is a set of ranks each holding a
//! [`Communicator`] handle. Handles are created once, shared read-only
//! (`Arc`) by every layer of a rank, and never mutated by a call.
//!
//! Coordination failures (a peer timing out, a peer contributing buffers
//! of a different size, a poisoned group) are reported as `Internal`.

use serde::{Deserialize, Serialize};

use crate::params::{AllReduceParams, BroadcastParams};
use crate::tensor::Tensor;
use crate::Result;

/// Handle on one rank of a communication group.
pub trait Communicator<T: Tensor>: Send + Sync {
    /// This handle's rank (`0..world_size`).
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Copy every buffer of `params.root` into the same-position buffer on
    /// every other rank. Blocks until the whole group has participated.
    fn broadcast(&self, params: BroadcastParams<'_, T>) -> Result<()>;

    /// Sum every buffer element-wise across the group, in place. Every rank
    /// receives bit-identical results.
    fn all_reduce(&self, params: AllReduceParams<'_, T>) -> Result<()>;

    /// Skip this rank's next collective round. That round fails with
    /// `Internal` on every peer, including peers already blocked in it;
    /// later rounds run normally. Used when a rank fails before reaching a
    /// collective its peers are waiting in.
    fn abort(&self, reason: &str);
}

/// Limits under which a custom all-reduce is used instead of the generic
/// collective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomAllReduceConfig {
    pub enabled: bool,
    /// Largest per-rank payload handled.
    pub max_bytes: usize,
    /// Largest group handled.
    pub max_world_size: usize,
}

impl Default for CustomAllReduceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 8 << 20,
            max_world_size: 8,
        }
    }
}

impl CustomAllReduceConfig {
    #[must_use]
    pub fn admits(&self, world_size: usize, bytes: usize) -> bool {
        self.enabled && world_size > 1 && world_size <= self.max_world_size && bytes <= self.max_bytes
    }
}

/// Low-latency all-reduce for small payloads.
///
/// Eligibility depends only on values every rank agrees on (group size and
/// payload size), so all ranks pick the same implementation for a call.
pub trait CustomAllReduce<T: Tensor>: Send + Sync {
    fn config(&self) -> &CustomAllReduceConfig;

    fn is_eligible(&self, world_size: usize, bytes: usize) -> bool {
        self.config().admits(world_size, bytes)
    }

    /// Sum in place across the group. Same contract as
    /// [`Communicator::all_reduce`].
    fn all_reduce(&self, params: AllReduceParams<'_, T>) -> Result<()>;
}

/// The trivial group of one rank.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleRank;

impl<T: Tensor> Communicator<T> for SingleRank {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn broadcast(&self, params: BroadcastParams<'_, T>) -> Result<()> {
        params.validate(1)
    }

    fn all_reduce(&self, _params: AllReduceParams<'_, T>) -> Result<()> {
        Ok(())
    }

    fn abort(&self, _reason: &str) {}
}
