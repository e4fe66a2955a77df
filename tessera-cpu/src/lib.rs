//! Reference CPU backend for tessera.
//!
//! Implements every op trait in plain f32 host arithmetic: inputs of any
//! supported dtype are widened to f32, computed, and cast back into the
//! output's dtype. Row loops are parallelized with Rayon.
//!
//! Also provides [`LocalComm`], an in-process communication group for
//! running several tensor-parallel ranks as threads of one process.
//!
//! This backend is intended for testing backends and distributed layers
//! against a readable reference. It is not optimised for throughput.

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod comm;
pub mod ops;
pub mod tensor;

use tessera::backend::Backend;

pub use comm::{LocalComm, OneShotAllReduce};
pub use tensor::CpuTensor;

/// Marker type for the CPU backend.
///
/// All op trait impls are on this type. Layers parameterised by
/// `B: OpProvider` can use `CpuBackend` to run on CPU.
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Tensor = CpuTensor;
}
