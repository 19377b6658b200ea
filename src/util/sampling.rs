// SPDX-License-Identifier: MIT OR Apache-2.0

//! Next-token sampling from a logit vector.

use candle_core::{DType, Tensor};
use rand::Rng;

use crate::error::{LensError, Result};

/// Sampling settings for [`generate`](crate::HookedTransformer::generate).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingOptions {
    /// Softmax temperature; `<= 0` means greedy decoding.
    pub temperature: f32,
    /// Keep only the `k` most likely tokens before sampling.
    pub top_k: Option<usize>,
    /// Keep the smallest set of tokens whose probability mass reaches `p`.
    pub top_p: Option<f32>,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
            top_p: None,
        }
    }
}

impl SamplingOptions {
    /// Greedy (argmax) decoding.
    #[must_use]
    pub const fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: None,
            top_p: None,
        }
    }
}

/// Sample a token from logits.
///
/// When `temperature <= 0.0`, performs greedy (argmax) decoding.
///
/// # Shapes
/// - `logits`: `[vocab_size]`
///
/// # Errors
///
/// Returns [`LensError::Model`] if the logits tensor is empty or cannot be
/// converted to `f32`.
pub fn sample_token(logits: &Tensor, options: &SamplingOptions) -> Result<u32> {
    let logits: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    if logits.is_empty() {
        return Err(LensError::Model(candle_core::Error::Msg("empty logits".into())));
    }
    if options.temperature <= 0.0 {
        return Ok(argmax(&logits));
    }
    Ok(sample_with_temperature(&logits, options, &mut rand::thread_rng()))
}

/// Greedy (argmax) sampling.
fn argmax(logits: &[f32]) -> u32 {
    let idx = logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map_or(0, |(i, _)| i);
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    let id = idx as u32;
    id
}

/// Temperature-scaled softmax sampling with optional top-k / top-p.
fn sample_with_temperature<R: Rng>(logits: &[f32], options: &SamplingOptions, rng: &mut R) -> u32 {
    let scaled: Vec<f32> = logits.iter().map(|x| x / options.temperature).collect();

    // Numerically stable softmax.
    let max_val = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = scaled.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();

    let mut candidates: Vec<(usize, f32)> = exp_vals
        .iter()
        .enumerate()
        .map(|(i, e)| (i, e / sum))
        .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

    if let Some(k) = options.top_k {
        candidates.truncate(k.max(1));
    }
    if let Some(p) = options.top_p {
        let mut mass = 0.0;
        let mut keep = 0;
        for (_, prob) in &candidates {
            keep += 1;
            mass += prob;
            if mass >= p {
                break;
            }
        }
        candidates.truncate(keep.max(1));
    }

    let total: f32 = candidates.iter().map(|(_, p)| p).sum();
    let r: f32 = rng.r#gen::<f32>() * total;
    let mut cumsum = 0.0;
    for &(idx, p) in &candidates {
        cumsum += p;
        if r < cumsum {
            #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
            return idx as u32;
        }
    }

    // Floating-point rounding edge case.
    let last = candidates.last().map_or(0, |(i, _)| *i);
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    let id = last as u32;
    id
}
