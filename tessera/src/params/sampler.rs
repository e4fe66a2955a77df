//! Stochastic token selection contracts.
//!
//! Every backend performs the same per-step bookkeeping:
//! - rows already `finished` emit `eos_id` and keep their length,
//! - other rows write the sampled id at column `step` of `output_ids`,
//!   bump `sequence_length`, accumulate `log p` into `cum_log_probs`, and
//!   become finished when they emit `eos_id`.

use crate::dtype::DType;
use crate::error::{OpError, Result};
use crate::tensor::{expect_index, expect_numel, expect_shape, Tensor};

/// Shared inputs and outputs of one sampling step.
pub struct SamplerParams<'a, T> {
    /// `[batch, vocab]`
    pub logits: &'a T,
    /// `[1]` index of the column being generated.
    pub step: &'a T,
    /// `[1]` first generated column. Prompts sit left-aligned in
    /// `output_ids` and are padded up to this column.
    pub max_input_length: &'a T,
    /// `[batch]` unpadded prompt lengths.
    pub input_lengths: &'a T,
    /// `[1]` shared or `[batch]` per request.
    pub eos_id: &'a T,

    /// `[batch, max_len]`
    pub output_ids: &'a mut T,
    /// `[batch]`
    pub sequence_length: &'a mut T,
    /// `[batch]` U8 flags.
    pub finished: &'a mut T,
    /// `[batch]`
    pub cum_log_probs: &'a mut T,
    /// `[batch, max_len]`
    pub output_log_probs: Option<&'a mut T>,
}

impl<T: Tensor> SamplerParams<'_, T> {
    /// Validate buffer shapes and return `(batch, vocab)`.
    ///
    /// # Errors
    /// `InvalidArgs` for any shape or dtype mismatch.
    pub fn validate(&self) -> Result<(usize, usize)> {
        let shape = self.logits.shape();
        if shape.len() != 2 || shape[0] == 0 || shape[1] == 0 {
            return Err(OpError::invalid_args(format!(
                "sampler: logits must be a non-empty [batch, vocab], got {shape:?}"
            )));
        }
        let (batch, vocab) = (shape[0], shape[1]);
        for (what, t) in [("step", self.step), ("max_input_length", self.max_input_length)] {
            expect_numel(what, t, 1)?;
            expect_index(what, t)?;
        }
        expect_numel("input_lengths", self.input_lengths, batch)?;
        expect_index("input_lengths", self.input_lengths)?;
        if self.eos_id.numel() != 1 && self.eos_id.numel() != batch {
            return Err(OpError::invalid_args(format!(
                "sampler: eos_id must have 1 or {batch} elements, got {}",
                self.eos_id.numel()
            )));
        }
        expect_index("eos_id", self.eos_id)?;

        let out = self.output_ids.shape();
        if out.len() != 2 || out[0] != batch {
            return Err(OpError::invalid_args(format!(
                "sampler: output_ids must be [{batch}, max_len], got {out:?}"
            )));
        }
        expect_index("output_ids", &*self.output_ids)?;
        expect_numel("sequence_length", &*self.sequence_length, batch)?;
        expect_index("sequence_length", &*self.sequence_length)?;
        expect_numel("finished", &*self.finished, batch)?;
        if self.finished.dtype() != DType::U8 {
            return Err(OpError::invalid_args(format!(
                "sampler: finished must be u8, got {}",
                self.finished.dtype()
            )));
        }
        expect_numel("cum_log_probs", &*self.cum_log_probs, batch)?;
        if let Some(lp) = self.output_log_probs.as_deref() {
            expect_shape("output_log_probs", lp, out)?;
        }
        Ok((batch, vocab))
    }
}

/// Per-request hyperparameters shared by both sampling strategies.
///
/// Every buffer is `[1]` (shared) or `[batch]`.
pub struct SamplingKnobs<'a, T> {
    pub temperature: Option<&'a T>,
    pub random_seed: Option<&'a T>,
    pub repetition_penalty: Option<&'a T>,
}

impl<T> Default for SamplingKnobs<'_, T> {
    fn default() -> Self {
        Self {
            temperature: None,
            random_seed: None,
            repetition_penalty: None,
        }
    }
}

impl<T: Tensor> SamplingKnobs<'_, T> {
    fn validate(&self, batch: usize) -> Result<()> {
        for (what, t) in [
            ("temperature", self.temperature),
            ("random_seed", self.random_seed),
            ("repetition_penalty", self.repetition_penalty),
        ] {
            check_per_request(what, t, batch)?;
        }
        if let Some(seed) = self.random_seed {
            expect_index("random_seed", seed)?;
        }
        Ok(())
    }
}

fn check_per_request<T: Tensor>(what: &str, t: Option<&T>, batch: usize) -> Result<()> {
    match t {
        Some(t) if t.numel() != 1 && t.numel() != batch => Err(OpError::invalid_args(format!(
            "sampler: {what} must have 1 or {batch} elements, got {}",
            t.numel()
        ))),
        _ => Ok(()),
    }
}

/// Nucleus sampling: draw from the smallest prefix of the sorted
/// distribution whose mass reaches `top_p`.
pub struct TopPSamplerParams<'a, T> {
    pub sampler_params: SamplerParams<'a, T>,
    /// `[1]` or `[batch]`, each in `(0, 1]`.
    pub top_p: &'a T,
    pub knobs: SamplingKnobs<'a, T>,
}

impl<'a, T: Tensor> TopPSamplerParams<'a, T> {
    pub fn new(sampler_params: SamplerParams<'a, T>, top_p: &'a T) -> Self {
        Self {
            sampler_params,
            top_p,
            knobs: SamplingKnobs::default(),
        }
    }

    #[must_use]
    pub fn with_knobs(mut self, knobs: SamplingKnobs<'a, T>) -> Self {
        self.knobs = knobs;
        self
    }

    /// # Errors
    /// `InvalidArgs` for shape mismatches.
    pub fn validate(&self) -> Result<(usize, usize)> {
        let (batch, vocab) = self.sampler_params.validate()?;
        check_per_request("top_p", Some(self.top_p), batch)?;
        self.knobs.validate(batch)?;
        Ok((batch, vocab))
    }
}

/// Draw from the `top_k` most likely tokens (`0` means the whole vocabulary).
pub struct TopKSamplerParams<'a, T> {
    pub sampler_params: SamplerParams<'a, T>,
    /// `[1]` or `[batch]`
    pub top_k: &'a T,
    pub knobs: SamplingKnobs<'a, T>,
}

impl<'a, T: Tensor> TopKSamplerParams<'a, T> {
    pub fn new(sampler_params: SamplerParams<'a, T>, top_k: &'a T) -> Self {
        Self {
            sampler_params,
            top_k,
            knobs: SamplingKnobs::default(),
        }
    }

    #[must_use]
    pub fn with_knobs(mut self, knobs: SamplingKnobs<'a, T>) -> Self {
        self.knobs = knobs;
        self
    }

    /// # Errors
    /// `InvalidArgs` for shape mismatches or a non-index `top_k`.
    pub fn validate(&self) -> Result<(usize, usize)> {
        let (batch, vocab) = self.sampler_params.validate()?;
        check_per_request("top_k", Some(self.top_k), batch)?;
        expect_index("top_k", self.top_k)?;
        self.knobs.validate(batch)?;
        Ok((batch, vocab))
    }
}
