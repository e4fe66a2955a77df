//! Data types for tensor elements

use std::fmt;

use serde::{Deserialize, Serialize};

/// Supported data types for tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// Brain floating point (16-bit)
    BF16,
    /// 8-bit signed integer (quantized weights and activations)
    I8,
    /// 32-bit signed integer (lengths, offsets, ids)
    I32,
    /// 32-bit unsigned integer
    U32,
    /// 8-bit unsigned integer (flags)
    U8,
}

impl DType {
    /// Size of the dtype in bytes
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::I8 | Self::U8 => 1,
        }
    }

    /// Whether this is a floating-point type
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F16 | Self::BF16)
    }

    /// Whether this dtype can hold lengths, offsets and ids
    #[must_use]
    pub const fn is_index(self) -> bool {
        matches!(self, Self::I32 | Self::U32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::BF16 => write!(f, "bf16"),
            Self::I8 => write!(f, "i8"),
            Self::I32 => write!(f, "i32"),
            Self::U32 => write!(f, "u32"),
            Self::U8 => write!(f, "u8"),
        }
    }
}

/// Trait for types that can be used as tensor elements
pub trait TensorDType: Copy + Clone + Default + Send + Sync + 'static {
    /// The corresponding `DType` enum value
    const DTYPE: DType;
}

impl TensorDType for f32 {
    const DTYPE: DType = DType::F32;
}

impl TensorDType for half::f16 {
    const DTYPE: DType = DType::F16;
}

impl TensorDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
}

impl TensorDType for i8 {
    const DTYPE: DType = DType::I8;
}

impl TensorDType for i32 {
    const DTYPE: DType = DType::I32;
}

impl TensorDType for u32 {
    const DTYPE: DType = DType::U32;
}

impl TensorDType for u8 {
    const DTYPE: DType = DType::U8;
}
