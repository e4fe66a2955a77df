//! Collective communication contracts.

use crate::error::{OpError, Result};
use crate::tensor::Tensor;

/// Copy every buffer from `root` to all other ranks of the group.
pub struct BroadcastParams<'a, T> {
    pub buffers: &'a mut [T],
    pub root: usize,
}

impl<'a, T: Tensor> BroadcastParams<'a, T> {
    pub fn new(buffers: &'a mut [T], root: usize) -> Self {
        Self { buffers, root }
    }

    /// # Errors
    /// `InvalidArgs` when `root` is not a rank of a `world_size` group.
    pub fn validate(&self, world_size: usize) -> Result<()> {
        if self.root >= world_size {
            return Err(OpError::invalid_args(format!(
                "broadcast: root {} outside group of {world_size}",
                self.root
            )));
        }
        Ok(())
    }
}

/// Element-wise sum of every buffer across the group, written back in place
/// on every rank.
pub struct AllReduceParams<'a, T> {
    pub buffers: &'a mut [T],
}

impl<'a, T: Tensor> AllReduceParams<'a, T> {
    pub fn new(buffers: &'a mut [T]) -> Self {
        Self { buffers }
    }

    /// Total payload of one rank's contribution.
    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        self.buffers.iter().map(Tensor::size_in_bytes).sum()
    }
}
