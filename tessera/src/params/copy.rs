//! Element-wise copy between two buffers.

use crate::error::{OpError, Result};
use crate::tensor::Tensor;

/// Element range of a partial copy, in elements of the shared dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    pub src_offset: usize,
    pub dst_offset: usize,
    pub count: usize,
}

/// `dst <- src`, either whole-buffer or over a [`CopyRegion`].
pub struct CopyParams<'a, T> {
    pub src: &'a T,
    pub dst: &'a mut T,
    pub region: Option<CopyRegion>,
}

impl<'a, T: Tensor> CopyParams<'a, T> {
    /// Whole-buffer copy.
    pub fn new(src: &'a T, dst: &'a mut T) -> Self {
        Self {
            src,
            dst,
            region: None,
        }
    }

    /// Copy `count` elements from `src[src_offset..]` to `dst[dst_offset..]`.
    #[must_use]
    pub fn with_region(mut self, src_offset: usize, dst_offset: usize, count: usize) -> Self {
        self.region = Some(CopyRegion {
            src_offset,
            dst_offset,
            count,
        });
        self
    }

    /// Resolve the effective region after validating dtypes and bounds.
    ///
    /// # Errors
    /// `InvalidArgs` on dtype mismatch, element-count mismatch for a full
    /// copy, or a region that runs past either buffer.
    pub fn validate(&self) -> Result<CopyRegion> {
        if self.src.dtype() != self.dst.dtype() {
            return Err(OpError::invalid_args(format!(
                "copy: dtype mismatch {} -> {}",
                self.src.dtype(),
                self.dst.dtype()
            )));
        }
        match self.region {
            None => {
                if self.src.numel() != self.dst.numel() {
                    return Err(OpError::invalid_args(format!(
                        "copy: element count mismatch {:?} -> {:?}",
                        self.src.shape(),
                        self.dst.shape()
                    )));
                }
                Ok(CopyRegion {
                    src_offset: 0,
                    dst_offset: 0,
                    count: self.src.numel(),
                })
            }
            Some(region) => {
                if region.src_offset + region.count > self.src.numel()
                    || region.dst_offset + region.count > self.dst.numel()
                {
                    return Err(OpError::invalid_args(format!(
                        "copy: region {region:?} out of bounds (src {} elements, dst {} elements)",
                        self.src.numel(),
                        self.dst.numel()
                    )));
                }
                Ok(region)
            }
        }
    }
}
