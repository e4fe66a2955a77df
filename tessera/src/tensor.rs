//! Buffer trait consumed by every operator contract
//!
//! The memory behind a tensor is owned by the buffer collaborator (a backend
//! crate). Operators only read shapes and dtypes through this trait, and
//! backends reach the raw memory through their concrete tensor type.

use crate::dtype::DType;
use crate::error::{OpError, Result};

/// Core tensor trait that defines the interface for all buffer implementations
pub trait Tensor: Sized {
    /// Returns the shape of the tensor as a slice of dimensions
    fn shape(&self) -> &[usize];

    /// Returns the data type of tensor elements
    fn dtype(&self) -> DType;

    /// Create a view with a different shape (same data, same number of elements).
    ///
    /// # Panics
    /// Panics if the new shape has a different number of elements.
    #[must_use]
    fn reshape(&self, shape: &[usize]) -> Self;

    /// Create a zero-copy sub-slice view starting at element `offset` with the
    /// given `shape`.
    ///
    /// # Panics
    /// Panics if the view extends beyond the backing allocation.
    #[must_use]
    fn slice_view(&self, offset: usize, shape: &[usize]) -> Self;

    /// Returns the total number of elements in the tensor
    fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Returns the number of dimensions (rank) of the tensor
    fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Size of the innermost dimension (1 for scalars)
    fn last_dim(&self) -> usize {
        self.shape().last().copied().unwrap_or(1)
    }

    /// Product of every dimension except the last: the row count of a
    /// `[..., hidden]` activation.
    fn rows(&self) -> usize {
        let shape = self.shape();
        shape[..shape.len().saturating_sub(1)].iter().product()
    }

    /// Returns the stride for each dimension
    fn strides(&self) -> Vec<usize> {
        let shape = self.shape();
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Returns the size of the tensor data in bytes
    fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype().size_in_bytes()
    }
}

/// Check that `tensor` has exactly `expected` shape.
///
/// # Errors
/// `InvalidArgs` naming `what` when the shapes differ.
pub fn expect_shape<T: Tensor>(what: &str, tensor: &T, expected: &[usize]) -> Result<()> {
    if tensor.shape() == expected {
        Ok(())
    } else {
        Err(OpError::invalid_args(format!(
            "{what}: expected shape {expected:?}, got {:?}",
            tensor.shape()
        )))
    }
}

/// Check that `tensor` holds exactly `expected` elements.
///
/// # Errors
/// `InvalidArgs` naming `what` when the element count differs.
pub fn expect_numel<T: Tensor>(what: &str, tensor: &T, expected: usize) -> Result<()> {
    if tensor.numel() == expected {
        Ok(())
    } else {
        Err(OpError::invalid_args(format!(
            "{what}: expected {expected} elements, got {} (shape {:?})",
            tensor.numel(),
            tensor.shape()
        )))
    }
}

/// Check that `tensor` is an index buffer (I32 or U32).
///
/// # Errors
/// `InvalidArgs` naming `what` for any other dtype.
pub fn expect_index<T: Tensor>(what: &str, tensor: &T) -> Result<()> {
    if tensor.dtype().is_index() {
        Ok(())
    } else {
        Err(OpError::invalid_args(format!(
            "{what}: expected i32/u32 buffer, got {}",
            tensor.dtype()
        )))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::OpErrorType;

    /// Shape-only tensor for exercising backend-agnostic code.
    #[derive(Clone, Debug)]
    pub(crate) struct FakeTensor {
        pub shape: Vec<usize>,
        pub dtype: DType,
    }

    impl FakeTensor {
        pub(crate) fn new(shape: &[usize], dtype: DType) -> Self {
            Self {
                shape: shape.to_vec(),
                dtype,
            }
        }
    }

    impl Tensor for FakeTensor {
        fn shape(&self) -> &[usize] {
            &self.shape
        }

        fn dtype(&self) -> DType {
            self.dtype
        }

        fn reshape(&self, shape: &[usize]) -> Self {
            let new_numel: usize = shape.iter().product();
            assert_eq!(self.numel(), new_numel);
            Self::new(shape, self.dtype)
        }

        fn slice_view(&self, _offset: usize, shape: &[usize]) -> Self {
            Self::new(shape, self.dtype)
        }
    }

    #[test]
    fn test_numel_and_rows() {
        let t = FakeTensor::new(&[2, 3, 4], DType::F32);
        assert_eq!(t.numel(), 24);
        assert_eq!(t.rows(), 6);
        assert_eq!(t.last_dim(), 4);
    }

    #[test]
    fn test_scalar() {
        let t = FakeTensor::new(&[], DType::F32);
        assert_eq!(t.numel(), 1);
        assert_eq!(t.rows(), 1);
        assert_eq!(t.last_dim(), 1);
        assert_eq!(t.strides(), Vec::<usize>::new());
    }

    #[test]
    fn test_strides_3d() {
        let t = FakeTensor::new(&[2, 3, 4], DType::F32);
        assert_eq!(t.strides(), vec![12, 4, 1]);
    }

    #[test]
    fn test_size_in_bytes() {
        assert_eq!(FakeTensor::new(&[2, 3], DType::F32).size_in_bytes(), 24);
        assert_eq!(FakeTensor::new(&[2, 3], DType::BF16).size_in_bytes(), 12);
        assert_eq!(FakeTensor::new(&[5], DType::I8).size_in_bytes(), 5);
    }

    #[test]
    fn test_expect_shape() {
        let t = FakeTensor::new(&[2, 8], DType::F32);
        assert!(expect_shape("input", &t, &[2, 8]).is_ok());
        let err = expect_shape("input", &t, &[2, 4]).unwrap_err();
        assert_eq!(err.error_type(), OpErrorType::InvalidArgs);
        assert!(err.message().contains("input"));
    }

    #[test]
    fn test_expect_numel_and_index() {
        let lengths = FakeTensor::new(&[3], DType::I32);
        assert!(expect_numel("input_lengths", &lengths, 3).is_ok());
        assert!(expect_numel("input_lengths", &lengths, 4).is_err());
        assert!(expect_index("input_lengths", &lengths).is_ok());
        let floats = FakeTensor::new(&[3], DType::F32);
        assert!(expect_index("input_lengths", &floats).is_err());
    }
}
