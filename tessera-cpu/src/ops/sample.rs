//! SamplerOps implementation for CpuBackend.
//!
//! Both strategies share the same pipeline per row: repetition penalty,
//! temperature, softmax, sort descending, truncate (top-p or top-k), then
//! draw from the renormalized head with a `StdRng` seeded from the request
//! seed and the step.
//!
//! The penalty history of a row is its prompt (`input_lengths[i]` leading
//! columns) plus the tokens generated from column `max_input_length` on.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tessera::backend::SamplerOps;
use tessera::params::{SamplerParams, SamplingKnobs, TopKSamplerParams, TopPSamplerParams};
use tessera::tensor::Tensor;
use tessera::{OpError, Result};
use tracing::trace;

use super::{per_request_f32, read_counts};
use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// Truncation rule applied to the sorted distribution of one row.
#[derive(Debug, Clone, Copy)]
enum Truncation {
    TopP(f32),
    TopK(usize),
}

impl Truncation {
    /// Length of the kept head of `sorted` (descending probabilities).
    fn cutoff(self, sorted: &[(usize, f32)]) -> usize {
        match self {
            Self::TopP(top_p) => {
                let mut cumulative = 0.0f32;
                for (i, &(_, p)) in sorted.iter().enumerate() {
                    cumulative += p;
                    if cumulative >= top_p {
                        return i + 1;
                    }
                }
                sorted.len()
            }
            Self::TopK(0) => sorted.len(),
            Self::TopK(k) => k.min(sorted.len()),
        }
    }
}

/// Per-row knobs resolved to host values.
struct RowKnobs {
    temperature: f32,
    repetition_penalty: f32,
    seed: u64,
}

/// Token drawn for one row and its log-probability under the tempered
/// distribution.
struct Draw {
    token: usize,
    log_prob: f32,
}

#[allow(clippy::float_cmp)]
fn sample_row(
    logits: &[f32],
    history: &[i64],
    knobs: &RowKnobs,
    truncation: Truncation,
    step: usize,
) -> Draw {
    let mut logits = logits.to_vec();

    if knobs.repetition_penalty != 1.0 {
        for &tok in history {
            let Ok(idx) = usize::try_from(tok) else {
                continue;
            };
            if let Some(l) = logits.get_mut(idx) {
                if *l > 0.0 {
                    *l /= knobs.repetition_penalty;
                } else {
                    *l *= knobs.repetition_penalty;
                }
            }
        }
    }

    if knobs.temperature != 1.0 {
        for l in &mut logits {
            *l /= knobs.temperature;
        }
    }

    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|l| (l - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    for p in &mut probs {
        *p /= sum;
    }

    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    let nucleus = &indexed[..truncation.cutoff(&indexed)];

    let nucleus_sum: f32 = nucleus.iter().map(|(_, p)| p).sum();
    let mut rng = StdRng::seed_from_u64((knobs.seed << 32) | step as u64);
    let r: f32 = rng.gen();
    let mut cumul = 0.0;
    let mut token = nucleus[0].0;
    for &(idx, p) in nucleus {
        cumul += p / nucleus_sum;
        if cumul >= r {
            token = idx;
            break;
        }
    }
    Draw {
        token,
        log_prob: probs[token].ln(),
    }
}

fn row_knobs(knobs: &SamplingKnobs<'_, CpuTensor>, batch: usize) -> Result<Vec<RowKnobs>> {
    let temperature = per_request_f32(knobs.temperature, batch, 1.0);
    let penalty = per_request_f32(knobs.repetition_penalty, batch, 1.0);
    let seeds = match knobs.random_seed {
        None => vec![0; batch],
        Some(s) => {
            let seeds = s.to_index_vec()?;
            if seeds.len() == 1 {
                vec![seeds[0]; batch]
            } else {
                seeds
            }
        }
    };
    if let Some(t) = temperature.iter().find(|t| **t <= 0.0 || !t.is_finite()) {
        return Err(OpError::invalid_args(format!(
            "sampler: temperature must be > 0, got {t}"
        )));
    }
    if let Some(p) = penalty.iter().find(|p| **p <= 0.0 || !p.is_finite()) {
        return Err(OpError::invalid_args(format!(
            "sampler: repetition_penalty must be > 0, got {p}"
        )));
    }
    Ok(temperature
        .into_iter()
        .zip(penalty)
        .zip(seeds)
        .map(|((temperature, repetition_penalty), seed)| RowKnobs {
            temperature,
            repetition_penalty,
            seed: seed as u64,
        })
        .collect())
}

/// One sampling step over every row, followed by the shared bookkeeping.
fn run_step(
    params: SamplerParams<'_, CpuTensor>,
    knobs: &SamplingKnobs<'_, CpuTensor>,
    truncations: &[Truncation],
    batch: usize,
    vocab: usize,
) -> Result<()> {
    let step = read_counts("step", params.step)?[0];
    let max_len = params.output_ids.shape()[1];
    if step >= max_len {
        return Err(OpError::invalid_args(format!(
            "sampler: step {step} out of range for output_ids with {max_len} columns"
        )));
    }
    let max_input = read_counts("max_input_length", params.max_input_length)?[0];
    let input_lengths = read_counts("input_lengths", params.input_lengths)?;
    if step < max_input {
        return Err(OpError::invalid_args(format!(
            "sampler: step {step} is inside the prompt region of {max_input} columns"
        )));
    }
    if let Some(len) = input_lengths.iter().find(|&&len| len > max_input) {
        return Err(OpError::invalid_args(format!(
            "sampler: input length {len} exceeds max_input_length {max_input}"
        )));
    }
    let knobs = row_knobs(knobs, batch)?;
    let eos = params.eos_id.to_index_vec()?;
    let eos_for = |i: usize| if eos.len() == 1 { eos[0] } else { eos[i] };

    let logits = params.logits.to_f32_vec();
    let mut output_ids = params.output_ids.to_index_vec()?;
    let mut lengths = params.sequence_length.to_index_vec()?;
    let mut finished: Vec<bool> = params.finished.as_bytes().iter().map(|&b| b != 0).collect();
    let mut cum_log_probs = params.cum_log_probs.to_f32_vec();

    let draws: Vec<Option<Draw>> = (0..batch)
        .into_par_iter()
        .map(|i| {
            if finished[i] {
                return None;
            }
            // Prompt tokens, then generated tokens; padding between is skipped.
            let row = &output_ids[i * max_len..(i + 1) * max_len];
            let history: Vec<i64> = row[..input_lengths[i]]
                .iter()
                .chain(&row[max_input..step])
                .copied()
                .collect();
            Some(sample_row(
                &logits[i * vocab..(i + 1) * vocab],
                &history,
                &knobs[i],
                truncations[i],
                step,
            ))
        })
        .collect();

    let mut step_log_probs = vec![0.0f32; batch];
    for (i, draw) in draws.into_iter().enumerate() {
        match draw {
            None => output_ids[i * max_len + step] = eos_for(i),
            Some(Draw { token, log_prob }) => {
                output_ids[i * max_len + step] = token as i64;
                lengths[i] += 1;
                cum_log_probs[i] += log_prob;
                step_log_probs[i] = log_prob;
                finished[i] = token as i64 == eos_for(i);
            }
        }
    }

    params.output_ids.write_index(&output_ids)?;
    params.sequence_length.write_index(&lengths)?;
    let flags: Vec<f32> = finished.iter().map(|&f| f32::from(u8::from(f))).collect();
    params.finished.write_f32(&flags);
    params.cum_log_probs.write_f32(&cum_log_probs);
    if let Some(out) = params.output_log_probs {
        let mut all = out.to_f32_vec();
        for (i, lp) in step_log_probs.into_iter().enumerate() {
            all[i * max_len + step] = lp;
        }
        out.write_f32(&all);
    }
    Ok(())
}

impl SamplerOps for CpuBackend {
    fn sample_top_p(params: TopPSamplerParams<'_, CpuTensor>) -> Result<()> {
        let (batch, vocab) = params.validate()?;
        let top_p = per_request_f32(Some(params.top_p), batch, 1.0);
        if let Some(p) = top_p.iter().find(|p| !(**p > 0.0 && **p <= 1.0)) {
            return Err(OpError::invalid_args(format!(
                "sampler: top_p must be in (0, 1], got {p}"
            )));
        }
        trace!(batch, vocab, "sample_top_p");
        let truncations: Vec<Truncation> = top_p.into_iter().map(Truncation::TopP).collect();
        run_step(params.sampler_params, &params.knobs, &truncations, batch, vocab)
    }

    fn sample_top_k(params: TopKSamplerParams<'_, CpuTensor>) -> Result<()> {
        let (batch, vocab) = params.validate()?;
        let mut top_k = read_counts("top_k", params.top_k)?;
        if top_k.len() == 1 {
            top_k = vec![top_k[0]; batch];
        }
        trace!(batch, vocab, "sample_top_k");
        let truncations: Vec<Truncation> = top_k.into_iter().map(Truncation::TopK).collect();
        run_step(params.sampler_params, &params.knobs, &truncations, batch, vocab)
    }
}
