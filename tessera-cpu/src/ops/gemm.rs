//! GemmOps implementation for CpuBackend.
//!
//! Operands of any supported dtype are widened to f32 and materialized in
//! their logical (post-transpose) layout. `B` is transposed to `Bᵀ (N,K)` so
//! `D[m,n] = dot(A[m,:], Bᵀ[n,:])` is a contiguous dot product. Output rows
//! are parallelized with Rayon.

use rayon::prelude::*;
use tessera::backend::GemmOps;
use tessera::dtype::DType;
use tessera::params::{GemmDims, GemmParams, GroupedGemmParams, TransposeOperation};
use tessera::tensor::Tensor;
use tessera::{OpError, Result};
use tracing::trace;

use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// Copy a `[rows, cols]` matrix into `[cols, rows]` order.
fn transpose(src: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = src[r * cols + c];
        }
    }
    out
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Value `i` of a per-tensor `[1]` or per-channel scale.
fn scale_at(scale: &[f32], i: usize) -> f32 {
    if scale.len() == 1 {
        scale[0]
    } else {
        scale[i]
    }
}

fn check_operand(what: &str, t: &CpuTensor, scale: Option<&CpuTensor>) -> Result<()> {
    match t.dtype() {
        DType::F32 | DType::F16 | DType::BF16 => Ok(()),
        DType::I8 if scale.is_some() => Ok(()),
        DType::I8 => Err(OpError::invalid_args(format!(
            "gemm: int8 operand {what} requires a scale"
        ))),
        other => Err(OpError::unimplemented(format!(
            "gemm: operand {what} dtype {other} not supported"
        ))),
    }
}

/// `A` of one batch entry as logical `[m, k]` rows.
fn logical_a(a: &[f32], dims: GemmDims, trans: TransposeOperation) -> Vec<f32> {
    if trans.is_transposed() {
        transpose(a, dims.k, dims.m)
    } else {
        a.to_vec()
    }
}

/// `B` of one batch entry as `Bᵀ`, i.e. `[n, k]` rows.
fn transposed_b(b: &[f32], dims: GemmDims, trans: TransposeOperation) -> Vec<f32> {
    if trans.is_transposed() {
        b.to_vec()
    } else {
        transpose(b, dims.k, dims.n)
    }
}

impl GemmOps for CpuBackend {
    #[allow(clippy::many_single_char_names)]
    fn gemm(params: GemmParams<'_, CpuTensor>) -> Result<()> {
        let dims = params.validate()?;
        if !matches!(params.computation_type, None | Some(DType::F32)) {
            return Err(OpError::unimplemented(format!(
                "gemm: computation type {:?} not supported",
                params.computation_type
            )));
        }
        check_operand("A", params.a, params.a_scale)?;
        check_operand("B", params.b, params.b_scale)?;
        trace!(?dims, alpha = params.alpha, beta = params.beta, "gemm");

        let GemmDims { batch, m, k, n } = dims;
        if batch * m * n == 0 {
            return Ok(());
        }

        let a = params.a.to_f32_vec();
        let b = params.b.to_f32_vec();
        let b_stride = if params.b.ndim() == 2 { 0 } else { k * n };
        let a_rows: Vec<Vec<f32>> = (0..batch)
            .map(|i| logical_a(&a[i * m * k..(i + 1) * m * k], dims, params.trans_a))
            .collect();
        let bt: Vec<Vec<f32>> = (0..batch)
            .map(|i| transposed_b(&b[i * b_stride..i * b_stride + k * n], dims, params.trans_b))
            .collect();

        let a_scale = params.a_scale.map(CpuTensor::to_f32_vec);
        let b_scale = params.b_scale.map(CpuTensor::to_f32_vec);
        let c_scale = params.c_scale.map(CpuTensor::to_f32_vec);
        // Without C, the in-place form reads D's prior contents.
        let c = if params.accumulates() {
            Some(params.c.map_or_else(|| params.d.to_f32_vec(), CpuTensor::to_f32_vec))
        } else {
            None
        };
        let (alpha, beta) = (params.alpha, params.beta);

        let mut out = vec![0.0f32; batch * m * n];
        out.par_chunks_mut(n).enumerate().for_each(|(r, d_row)| {
            let (bi, row) = (r / m, r % m);
            let a_row = &a_rows[bi][row * k..(row + 1) * k];
            let row_scale = a_scale.as_deref().map_or(1.0, |s| scale_at(s, row));
            for (col, d) in d_row.iter_mut().enumerate() {
                let col_scale = b_scale.as_deref().map_or(1.0, |s| scale_at(s, col));
                let acc = dot(a_row, &bt[bi][col * k..(col + 1) * k]) * row_scale * col_scale;
                *d = alpha * acc;
                if let Some(c) = &c {
                    let cs = c_scale.as_deref().map_or(1.0, |s| scale_at(s, col));
                    *d += beta * c[r * n + col] * cs;
                }
            }
        });
        params.d.write_f32(&out);
        Ok(())
    }

    fn grouped_gemm(params: GroupedGemmParams<'_, CpuTensor>) -> Result<()> {
        trace!(groups = params.len(), "grouped_gemm");
        params.into_groups()?.into_par_iter().try_for_each(Self::gemm)
    }
}
