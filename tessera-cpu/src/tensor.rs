//! CPU tensor implementation.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

use std::ops::Range;
use std::sync::Arc;

use tessera::dtype::{DType, TensorDType};
use tessera::tensor::Tensor;
use tessera::{OpError, Result};

/// A CPU-resident tensor backed by shared byte storage.
///
/// Uses `Arc<Vec<u8>>` so clones, `reshape` and `slice_view` are cheap
/// (shared backing). Writing through a tensor whose storage is shared first
/// detaches it, so a write never shows through another handle.
#[derive(Clone)]
pub struct CpuTensor {
    data: Arc<Vec<u8>>,
    offset: usize,
    shape: Vec<usize>,
    dtype: DType,
}

impl std::fmt::Debug for CpuTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuTensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish_non_exhaustive()
    }
}

impl CpuTensor {
    /// Create a tensor from a typed slice.
    ///
    /// # Panics
    /// Panics if `data.len()` differs from the shape's element count.
    #[must_use]
    pub fn from_slice<T: TensorDType + bytemuck::Pod>(shape: &[usize], data: &[T]) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            numel,
            "data len {} != shape product {numel}",
            data.len()
        );
        Self {
            data: Arc::new(bytemuck::cast_slice(data).to_vec()),
            offset: 0,
            shape: shape.to_vec(),
            dtype: T::DTYPE,
        }
    }

    /// Create a tensor from an f32 slice.
    #[must_use]
    pub fn from_f32(shape: &[usize], data: &[f32]) -> Self {
        Self::from_slice(shape, data)
    }

    /// Create a tensor from an i32 slice.
    #[must_use]
    pub fn from_i32(shape: &[usize], data: &[i32]) -> Self {
        Self::from_slice(shape, data)
    }

    /// Create a tensor from a u32 slice.
    #[must_use]
    pub fn from_u32(shape: &[usize], data: &[u32]) -> Self {
        Self::from_slice(shape, data)
    }

    /// Create a tensor from an i8 slice.
    #[must_use]
    pub fn from_i8(shape: &[usize], data: &[i8]) -> Self {
        Self::from_slice(shape, data)
    }

    /// Create a tensor from a u8 slice.
    #[must_use]
    pub fn from_u8(shape: &[usize], data: &[u8]) -> Self {
        Self::from_slice(shape, data)
    }

    /// Create a tensor of `dtype` holding `data` cast from f32.
    #[must_use]
    pub fn from_f32_as(shape: &[usize], dtype: DType, data: &[f32]) -> Self {
        let mut t = Self::zeros(shape, dtype);
        t.write_f32(data);
        t
    }

    /// Create a tensor from raw bytes with a given dtype.
    #[must_use]
    pub fn from_raw(shape: &[usize], dtype: DType, data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            offset: 0,
            shape: shape.to_vec(),
            dtype,
        }
    }

    /// Create a zero-filled tensor.
    #[must_use]
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let numel: usize = shape.iter().product();
        Self::from_raw(shape, dtype, vec![0u8; numel * dtype.size_in_bytes()])
    }

    /// Create a zero-filled tensor, reporting allocation failure instead of
    /// aborting.
    ///
    /// # Errors
    /// `ResourceExhausted` if the storage cannot be reserved.
    pub fn try_zeros(shape: &[usize], dtype: DType) -> Result<Self> {
        let bytes = shape
            .iter()
            .try_fold(dtype.size_in_bytes(), |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| {
                OpError::resource_exhausted(format!("allocation of {shape:?} {dtype} overflows"))
            })?;
        let mut data = Vec::new();
        data.try_reserve_exact(bytes).map_err(|e| {
            OpError::resource_exhausted(format!("cannot allocate {bytes} bytes: {e}"))
        })?;
        data.resize(bytes, 0);
        Ok(Self::from_raw(shape, dtype, data))
    }

    /// Get the data as an f32 slice.
    ///
    /// # Panics
    /// Panics if dtype is not F32.
    #[must_use]
    pub fn as_f32_slice(&self) -> &[f32] {
        assert_eq!(self.dtype, DType::F32, "expected F32 tensor");
        bytemuck::cast_slice(self.as_bytes())
    }

    /// Get the data as a mutable f32 slice, detaching shared storage.
    ///
    /// # Panics
    /// Panics if dtype is not F32.
    pub fn as_f32_slice_mut(&mut self) -> &mut [f32] {
        assert_eq!(self.dtype, DType::F32, "expected F32 tensor");
        bytemuck::cast_slice_mut(self.as_bytes_mut())
    }

    /// Get the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        let start = self.offset;
        let end = start + self.size_in_bytes();
        &self.data[start..end]
    }

    /// Get the raw bytes mutably, detaching shared storage.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let start = self.offset;
        let end = start + self.size_in_bytes();
        let data = Arc::make_mut(&mut self.data);
        &mut data[start..end]
    }

    /// Convert to an f32 Vec, casting from any dtype.
    #[must_use]
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let bytes = self.as_bytes();
        match self.dtype {
            DType::F32 => self.as_f32_slice().to_vec(),
            DType::BF16 => bytes
                .chunks_exact(2)
                .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            DType::F16 => bytes
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            DType::I8 => bytes.iter().map(|&b| f32::from(b as i8)).collect(),
            DType::U8 => bytes.iter().map(|&b| f32::from(b)).collect(),
            DType::I32 => bytes
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32)
                .collect(),
            DType::U32 => bytes
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32)
                .collect(),
        }
    }

    /// Read an index buffer (I32 or U32).
    ///
    /// # Errors
    /// `InvalidArgs` for any other dtype.
    pub fn to_index_vec(&self) -> Result<Vec<i64>> {
        let bytes = self.as_bytes().chunks_exact(4);
        match self.dtype {
            DType::I32 => Ok(bytes
                .map(|b| i64::from(i32::from_le_bytes([b[0], b[1], b[2], b[3]])))
                .collect()),
            DType::U32 => Ok(bytes
                .map(|b| i64::from(u32::from_le_bytes([b[0], b[1], b[2], b[3]])))
                .collect()),
            other => Err(OpError::invalid_args(format!(
                "expected i32/u32 buffer, got {other}"
            ))),
        }
    }

    /// Overwrite every element with `data` cast into this tensor's dtype.
    ///
    /// Integer dtypes round to nearest and saturate.
    ///
    /// # Panics
    /// Panics if `data.len()` differs from the element count.
    pub fn write_f32(&mut self, data: &[f32]) {
        assert_eq!(data.len(), self.numel(), "write_f32: length mismatch");
        let dtype = self.dtype;
        let bytes = self.as_bytes_mut();
        match dtype {
            DType::F32 => write_chunks(bytes, data, f32::to_le_bytes),
            DType::BF16 => write_chunks(bytes, data, |v| half::bf16::from_f32(v).to_le_bytes()),
            DType::F16 => write_chunks(bytes, data, |v| half::f16::from_f32(v).to_le_bytes()),
            DType::I8 => write_chunks(bytes, data, |v| [(v.round() as i8) as u8]),
            DType::U8 => write_chunks(bytes, data, |v| [v.round() as u8]),
            DType::I32 => write_chunks(bytes, data, |v| (v.round() as i32).to_le_bytes()),
            DType::U32 => write_chunks(bytes, data, |v| (v.round() as u32).to_le_bytes()),
        }
    }

    /// Overwrite an index buffer (I32 or U32) without a float round trip.
    ///
    /// # Errors
    /// `InvalidArgs` for any other dtype or a length mismatch.
    pub fn write_index(&mut self, data: &[i64]) -> Result<()> {
        if data.len() != self.numel() {
            return Err(OpError::invalid_args(format!(
                "write_index: {} values for {} elements",
                data.len(),
                self.numel()
            )));
        }
        let dtype = self.dtype;
        let bytes = self.as_bytes_mut();
        match dtype {
            DType::I32 => bytes
                .chunks_exact_mut(4)
                .zip(data)
                .for_each(|(dst, &v)| dst.copy_from_slice(&(v as i32).to_le_bytes())),
            DType::U32 => bytes
                .chunks_exact_mut(4)
                .zip(data)
                .for_each(|(dst, &v)| dst.copy_from_slice(&(v as u32).to_le_bytes())),
            other => {
                return Err(OpError::invalid_args(format!(
                    "expected i32/u32 buffer, got {other}"
                )))
            }
        }
        Ok(())
    }

    /// Copy of the rows `rows` of a 2-D tensor.
    ///
    /// # Panics
    /// Panics if the tensor is not 2-D or the range is out of bounds.
    #[must_use]
    pub fn narrow_rows(&self, rows: Range<usize>) -> Self {
        assert_eq!(self.shape.len(), 2, "narrow_rows: expected 2D tensor");
        let cols = self.shape[1];
        let elem = self.dtype.size_in_bytes();
        assert!(rows.end <= self.shape[0], "narrow_rows: out of bounds");
        let bytes = &self.as_bytes()[rows.start * cols * elem..rows.end * cols * elem];
        Self::from_raw(&[rows.len(), cols], self.dtype, bytes.to_vec())
    }

    /// Copy of the concatenation of column ranges of a 2-D tensor, in the
    /// given order.
    ///
    /// # Panics
    /// Panics if the tensor is not 2-D or a range is out of bounds.
    #[must_use]
    pub fn narrow_cols(&self, ranges: &[Range<usize>]) -> Self {
        assert_eq!(self.shape.len(), 2, "narrow_cols: expected 2D tensor");
        let (rows, cols) = (self.shape[0], self.shape[1]);
        let elem = self.dtype.size_in_bytes();
        let width: usize = ranges.iter().map(Range::len).sum();
        let src = self.as_bytes();
        let mut out = Vec::with_capacity(rows * width * elem);
        for r in 0..rows {
            for range in ranges {
                assert!(range.end <= cols, "narrow_cols: out of bounds");
                let base = r * cols;
                out.extend_from_slice(&src[(base + range.start) * elem..(base + range.end) * elem]);
            }
        }
        Self::from_raw(&[rows, width], self.dtype, out)
    }
}

fn write_chunks<const N: usize>(bytes: &mut [u8], data: &[f32], cast: impl Fn(f32) -> [u8; N]) {
    for (dst, &v) in bytes.chunks_exact_mut(N).zip(data) {
        dst.copy_from_slice(&cast(v));
    }
}

impl Tensor for CpuTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn reshape(&self, shape: &[usize]) -> Self {
        let new_numel: usize = shape.iter().product();
        assert_eq!(
            self.numel(),
            new_numel,
            "reshape: {} elements != {new_numel} elements",
            self.numel()
        );
        Self {
            data: Arc::clone(&self.data),
            offset: self.offset,
            shape: shape.to_vec(),
            dtype: self.dtype,
        }
    }

    fn slice_view(&self, offset: usize, shape: &[usize]) -> Self {
        let elem_size = self.dtype.size_in_bytes();
        let byte_offset = self.offset + offset * elem_size;
        let new_numel: usize = shape.iter().product();
        assert!(
            byte_offset + new_numel * elem_size <= self.data.len(),
            "slice_view out of bounds"
        );
        Self {
            data: Arc::clone(&self.data),
            offset: byte_offset,
            shape: shape.to_vec(),
            dtype: self.dtype,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_f32() {
        let t = CpuTensor::from_f32(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.dtype(), DType::F32);
        assert_eq!(t.numel(), 6);
        assert_eq!(t.as_f32_slice(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_reshape() {
        let t = CpuTensor::from_f32(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let r = t.reshape(&[3, 2]);
        assert_eq!(r.shape(), &[3, 2]);
        assert_eq!(r.as_f32_slice(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_slice_view() {
        let t = CpuTensor::from_f32(&[6], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let s = t.slice_view(2, &[3]);
        assert_eq!(s.shape(), &[3]);
        assert_eq!(s.as_f32_slice(), &[3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_zeros() {
        let t = CpuTensor::zeros(&[2, 2], DType::F32);
        assert_eq!(t.as_f32_slice(), &[0.0, 0.0, 0.0, 0.0]);
        let t = CpuTensor::try_zeros(&[3], DType::I8).unwrap();
        assert_eq!(t.as_bytes(), &[0, 0, 0]);
    }

    #[test]
    fn test_try_zeros_overflow_is_resource_exhausted() {
        let err = CpuTensor::try_zeros(&[usize::MAX, 2], DType::F32).unwrap_err();
        assert_eq!(err.error_type(), tessera::OpErrorType::ResourceExhausted);
    }

    #[test]
    fn test_clone_shares_data() {
        let t = CpuTensor::from_f32(&[3], &[1.0, 2.0, 3.0]);
        let c = t.clone();
        assert!(std::ptr::eq(t.data.as_ref(), c.data.as_ref()));
    }

    #[test]
    fn test_write_detaches_shared_storage() {
        let t = CpuTensor::from_f32(&[3], &[1.0, 2.0, 3.0]);
        let mut c = t.clone();
        c.as_f32_slice_mut()[0] = 9.0;
        assert_eq!(t.as_f32_slice(), &[1.0, 2.0, 3.0]);
        assert_eq!(c.as_f32_slice(), &[9.0, 2.0, 3.0]);
    }

    #[test]
    fn test_casts_round_trip_through_f32() {
        let values = [1.5, -2.0, 0.25];
        for dtype in [DType::F16, DType::BF16] {
            let t = CpuTensor::from_f32_as(&[3], dtype, &values);
            assert_eq!(t.to_f32_vec(), values.to_vec(), "{dtype}");
        }
        let t = CpuTensor::from_f32_as(&[3], DType::I8, &[3.4, -200.0, 127.6]);
        assert_eq!(t.to_f32_vec(), vec![3.0, -128.0, 127.0]);
        let t = CpuTensor::from_i32(&[2], &[-4, 7]);
        assert_eq!(t.to_index_vec().unwrap(), vec![-4, 7]);
        assert!(CpuTensor::from_f32(&[1], &[0.0]).to_index_vec().is_err());
    }

    #[test]
    fn test_narrow() {
        let t = CpuTensor::from_f32(&[2, 4], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let cols = t.narrow_cols(&[3..4, 0..1]);
        assert_eq!(cols.shape(), &[2, 2]);
        assert_eq!(cols.as_f32_slice(), &[3.0, 0.0, 7.0, 4.0]);
        let rows = t.narrow_rows(1..2);
        assert_eq!(rows.as_f32_slice(), &[4.0, 5.0, 6.0, 7.0]);
    }
}
