//! Dense, quantized and grouped GEMM contracts.
//!
//! `D = alpha * op(A) * op(B) + beta * C`
//!
//! Shapes are either `[m, k] x [k, n] -> [m, n]` or batched
//! `[bs, m, k] x [bs, k, n] -> [bs, m, n]`, always after applying the
//! transpose flags. A 2-D `B` may also be paired with an `A` of any rank
//! `>= 2`, whose leading dimensions are flattened into `m`.

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::error::{OpError, Result};
use crate::tensor::Tensor;

/// Operand layout selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransposeOperation {
    #[default]
    None,
    Transpose,
    /// Equal to `Transpose` for real-valued dtypes.
    ConjugateTranspose,
}

impl TransposeOperation {
    #[must_use]
    pub const fn is_transposed(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Resolved problem size of a GEMM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmDims {
    pub batch: usize,
    pub m: usize,
    pub k: usize,
    pub n: usize,
}

/// Parameters of a single GEMM.
///
/// Without `c`, a nonzero `beta` accumulates into `d`'s prior contents
/// (the in-place form). With `beta == 0` neither `c` nor `d`'s prior
/// contents influence the result.
pub struct GemmParams<'a, T> {
    pub a: &'a T,
    pub b: &'a T,
    pub c: Option<&'a T>,
    pub d: &'a mut T,

    /// Per-tensor `[1]` or per-row `[m]` scale of `op(A)`.
    pub a_scale: Option<&'a T>,
    /// Per-tensor `[1]` or per-column `[n]` scale of `op(B)`.
    pub b_scale: Option<&'a T>,
    /// Per-tensor `[1]` or per-column `[n]` scale of `C`.
    pub c_scale: Option<&'a T>,

    pub trans_a: TransposeOperation,
    pub trans_b: TransposeOperation,

    pub alpha: f32,
    pub beta: f32,
    pub computation_type: Option<DType>,
}

impl<'a, T: Tensor> GemmParams<'a, T> {
    /// `D = A * B` with default scalars (`alpha = 1`, `beta = 0`).
    pub fn new(a: &'a T, b: &'a T, d: &'a mut T) -> Self {
        Self {
            a,
            b,
            c: None,
            d,
            a_scale: None,
            b_scale: None,
            c_scale: None,
            trans_a: TransposeOperation::None,
            trans_b: TransposeOperation::None,
            alpha: 1.0,
            beta: 0.0,
            computation_type: None,
        }
    }

    #[must_use]
    pub fn with_c(mut self, c: &'a T) -> Self {
        self.c = Some(c);
        self
    }

    #[must_use]
    pub fn with_a_scale(mut self, scale: &'a T) -> Self {
        self.a_scale = Some(scale);
        self
    }

    #[must_use]
    pub fn with_b_scale(mut self, scale: &'a T) -> Self {
        self.b_scale = Some(scale);
        self
    }

    #[must_use]
    pub fn with_c_scale(mut self, scale: &'a T) -> Self {
        self.c_scale = Some(scale);
        self
    }

    #[must_use]
    pub fn transpose_a(mut self, op: TransposeOperation) -> Self {
        self.trans_a = op;
        self
    }

    #[must_use]
    pub fn transpose_b(mut self, op: TransposeOperation) -> Self {
        self.trans_b = op;
        self
    }

    #[must_use]
    pub fn alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    #[must_use]
    pub fn beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    #[must_use]
    pub fn computation_type(mut self, dtype: DType) -> Self {
        self.computation_type = Some(dtype);
        self
    }

    /// Whether the prior contents of `C` (or of `D` in the in-place form)
    /// contribute to the result.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn accumulates(&self) -> bool {
        self.beta != 0.0
    }

    /// Validate operand shapes and return the problem size.
    ///
    /// # Errors
    /// `InvalidArgs` for rank, inner-dimension, output-shape or scale-length
    /// mismatches.
    pub fn validate(&self) -> Result<GemmDims> {
        let a = self.a.shape();
        let b = self.b.shape();

        let dims = match (a.len(), b.len()) {
            (2, 2) => {
                let (m, k) = logical(a[0], a[1], self.trans_a);
                let (kb, n) = logical(b[0], b[1], self.trans_b);
                check_inner(k, kb, a, b)?;
                GemmDims { batch: 1, m, k, n }
            }
            (ra, 2) if ra > 2 && !self.trans_a.is_transposed() => {
                let (kb, n) = logical(b[0], b[1], self.trans_b);
                let k = a[ra - 1];
                check_inner(k, kb, a, b)?;
                GemmDims {
                    batch: 1,
                    m: a[..ra - 1].iter().product(),
                    k,
                    n,
                }
            }
            (3, 3) => {
                if a[0] != b[0] {
                    return Err(OpError::invalid_args(format!(
                        "gemm: batch mismatch A {a:?} vs B {b:?}"
                    )));
                }
                let (m, k) = logical(a[1], a[2], self.trans_a);
                let (kb, n) = logical(b[1], b[2], self.trans_b);
                check_inner(k, kb, a, b)?;
                GemmDims {
                    batch: a[0],
                    m,
                    k,
                    n,
                }
            }
            _ => {
                return Err(OpError::invalid_args(format!(
                    "gemm: unsupported operand ranks A {a:?} B {b:?}"
                )))
            }
        };

        let out_numel = dims.batch * dims.m * dims.n;
        check_output("D", self.d, out_numel, dims.n)?;
        if let Some(c) = self.c {
            check_output("C", c, out_numel, dims.n)?;
        }
        check_scale("A_scale", self.a_scale, dims.m)?;
        check_scale("B_scale", self.b_scale, dims.n)?;
        check_scale("C_scale", self.c_scale, dims.n)?;
        Ok(dims)
    }
}

fn logical(rows: usize, cols: usize, op: TransposeOperation) -> (usize, usize) {
    if op.is_transposed() {
        (cols, rows)
    } else {
        (rows, cols)
    }
}

fn check_inner(k: usize, kb: usize, a: &[usize], b: &[usize]) -> Result<()> {
    if k == kb {
        Ok(())
    } else {
        Err(OpError::invalid_args(format!(
            "gemm: inner dimension mismatch {k} vs {kb} (A {a:?}, B {b:?})"
        )))
    }
}

fn check_output<T: Tensor>(what: &str, t: &T, numel: usize, n: usize) -> Result<()> {
    if t.numel() == numel && t.last_dim() == n {
        Ok(())
    } else {
        Err(OpError::invalid_args(format!(
            "gemm: {what} shape {:?} does not hold {numel} elements with last dim {n}",
            t.shape()
        )))
    }
}

fn check_scale<T: Tensor>(what: &str, scale: Option<&T>, channels: usize) -> Result<()> {
    match scale {
        Some(s) if s.numel() != 1 && s.numel() != channels => Err(OpError::invalid_args(format!(
            "gemm: {what} must have 1 or {channels} elements, got {}",
            s.numel()
        ))),
        _ => Ok(()),
    }
}

/// Independent GEMMs over parallel operand sequences.
///
/// Each position `i` computes `D[i] = alpha * A[i] * B[i] + beta * C[i]`.
/// Results are identical to issuing the calls one by one.
pub struct GroupedGemmParams<'a, T> {
    pub a: &'a [T],
    pub b: &'a [T],
    pub c: Option<&'a [T]>,
    pub d: &'a mut [T],
    pub alpha: f32,
    pub beta: f32,
}

impl<'a, T: Tensor> GroupedGemmParams<'a, T> {
    pub fn new(a: &'a [T], b: &'a [T], d: &'a mut [T]) -> Self {
        Self {
            a,
            b,
            c: None,
            d,
            alpha: 1.0,
            beta: 0.0,
        }
    }

    #[must_use]
    pub fn with_c(mut self, c: &'a [T]) -> Self {
        self.c = Some(c);
        self
    }

    #[must_use]
    pub fn alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    #[must_use]
    pub fn beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.a.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.a.is_empty()
    }

    /// Check that every operand sequence has the same length.
    ///
    /// # Errors
    /// `InvalidArgs` on any length mismatch.
    pub fn validate(&self) -> Result<()> {
        let n = self.a.len();
        let c_len = self.c.map_or(n, <[T]>::len);
        if self.b.len() != n || self.d.len() != n || c_len != n {
            return Err(OpError::invalid_args(format!(
                "grouped gemm: operand count mismatch A={n} B={} C={c_len} D={}",
                self.b.len(),
                self.d.len()
            )));
        }
        Ok(())
    }

    /// Split into one [`GemmParams`] per group.
    ///
    /// # Errors
    /// `InvalidArgs` if the operand sequences differ in length.
    pub fn into_groups(self) -> Result<Vec<GemmParams<'a, T>>> {
        self.validate()?;
        let Self {
            a,
            b,
            c,
            d,
            alpha,
            beta,
        } = self;
        Ok(a.iter()
            .zip(b)
            .zip(d.iter_mut())
            .enumerate()
            .map(|(i, ((a, b), d))| {
                let mut p = GemmParams::new(a, b, d).alpha(alpha).beta(beta);
                if let Some(c) = c {
                    p = p.with_c(&c[i]);
                }
                p
            })
            .collect())
    }
}
