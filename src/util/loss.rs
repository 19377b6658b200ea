// SPDX-License-Identifier: MIT OR Apache-2.0

//! Next-token cross-entropy.

use candle_core::{D, DType, Tensor};

use crate::error::{LensError, Result};

/// Per-token next-token loss `-log p(token[t+1] | ..t)`.
///
/// # Shapes
/// - `logits`: `[batch, pos, vocab]`
/// - `tokens`: `[batch, pos]` (`u32`)
/// - returns: `[batch, pos - 1]` in `F32`
///
/// # Errors
///
/// Returns [`LensError::Config`] for sequences shorter than two tokens and
/// [`LensError::Model`] on tensor failures.
pub fn per_token_loss(logits: &Tensor, tokens: &Tensor) -> Result<Tensor> {
    let (_, seq_len, _) = logits.dims3()?;
    if seq_len < 2 {
        return Err(LensError::Config(
            "next-token loss needs at least two positions".into(),
        ));
    }
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let log_probs = log_probs.narrow(1, 0, seq_len - 1)?;
    let targets = tokens
        .narrow(1, 1, seq_len - 1)?
        .to_dtype(DType::U32)?
        .unsqueeze(2)?
        .contiguous()?;
    let picked = log_probs.contiguous()?.gather(&targets, 2)?.squeeze(2)?;
    Ok(picked.neg()?)
}

/// Mean next-token loss, optionally ignoring padded positions.
///
/// # Shapes
/// - `per_token`: `[batch, pos - 1]`
/// - `attention_mask`: `[batch, pos]`, `1` = real token
/// - returns: scalar
///
/// # Errors
///
/// Returns [`LensError::Model`] on tensor failures.
pub fn mean_loss(per_token: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
    match attention_mask {
        None => Ok(per_token.mean_all()?),
        Some(mask) => {
            let (_, n) = per_token.dims2()?;
            // A target counts when it is a real token.
            let weights = mask.narrow(1, 1, n)?.to_dtype(DType::F32)?;
            let total = (per_token * &weights)?.sum_all()?;
            Ok(total.broadcast_div(&weights.sum_all()?)?)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let tokens = Tensor::new(&[[0_u32, 1, 2]], &Device::Cpu).unwrap();
        let loss = per_token_loss(&logits, &tokens).unwrap();
        assert_eq!(loss.dims(), &[1, 2]);
        let mean: f32 = mean_loss(&loss, None).unwrap().to_scalar().unwrap();
        assert!((mean - 4.0_f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn masked_mean_ignores_padding() {
        let per_token = Tensor::new(&[[1.0_f32, 3.0]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1_u32, 1, 0]], &Device::Cpu).unwrap();
        let mean: f32 = mean_loss(&per_token, Some(&mask)).unwrap().to_scalar().unwrap();
        assert!((mean - 1.0).abs() < 1e-6);
    }

    #[test]
    fn single_token_is_error() {
        let logits = Tensor::zeros((1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let tokens = Tensor::new(&[[0_u32]], &Device::Cpu).unwrap();
        assert!(per_token_loss(&logits, &tokens).is_err());
    }
}
