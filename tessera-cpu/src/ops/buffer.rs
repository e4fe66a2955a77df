//! BufferOps and TensorDataOps implementation for CpuBackend.

use tessera::backend::{BufferOps, TensorDataOps};
use tessera::dtype::DType;
use tessera::params::CopyParams;
use tessera::tensor::Tensor;
use tessera::{OpError, Result};
use tracing::trace;

use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl BufferOps for CpuBackend {
    fn allocate(shape: &[usize], dtype: DType) -> Result<CpuTensor> {
        CpuTensor::try_zeros(shape, dtype)
    }

    fn copy(params: CopyParams<'_, CpuTensor>) -> Result<()> {
        let region = params.validate()?;
        trace!(?region, "copy");
        let elem = params.src.dtype().size_in_bytes();
        let src = &params.src.as_bytes()
            [region.src_offset * elem..(region.src_offset + region.count) * elem];
        let dst = params.dst.as_bytes_mut();
        dst[region.dst_offset * elem..(region.dst_offset + region.count) * elem]
            .copy_from_slice(src);
        Ok(())
    }
}

impl TensorDataOps for CpuBackend {
    fn from_f32_slice(shape: &[usize], dtype: DType, data: &[f32]) -> Result<CpuTensor> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(OpError::invalid_args(format!(
                "from_f32_slice: {} values for shape {shape:?}",
                data.len()
            )));
        }
        Ok(CpuTensor::from_f32_as(shape, dtype, data))
    }

    fn to_f32_vec(tensor: &CpuTensor) -> Result<Vec<f32>> {
        Ok(tensor.to_f32_vec())
    }

    fn to_index_vec(tensor: &CpuTensor) -> Result<Vec<i64>> {
        tensor.to_index_vec()
    }
}
