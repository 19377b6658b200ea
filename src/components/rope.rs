// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rotary position embeddings (`RoPE`).
//!
//! Pre-computes `cos` and `sin` tables at model construction and rotates
//! the first `rotary_dim` dimensions of each query and key head during
//! the forward pass (rotate-half layout).  The remaining dimensions pass
//! through unchanged.  Llama-3 checkpoints additionally rescale the
//! inverse frequencies with [`RopeScaling`].

use candle_core::{D, DType, Device, Tensor};

use crate::config::RopeScaling;
use crate::error::Result;

/// Inverse frequencies `theta^(-2i/rotary_dim)` for `i in 0..rotary_dim / 2`,
/// rescaled when `scaling` is given.
pub(crate) fn inverse_frequencies(
    rotary_dim: usize,
    theta: f64,
    scaling: Option<&RopeScaling>,
) -> Vec<f64> {
    (0..rotary_dim / 2)
        .map(|i| {
            #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
            let freq = 1.0 / theta.powf(2.0 * i as f64 / rotary_dim as f64);
            scaling.map_or(freq, |s| s.scale(freq))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// RoPE cache: pre-computed cos/sin
// ---------------------------------------------------------------------------

/// Pre-computed cosine and sine tables for rotary position embeddings.
#[derive(Debug, Clone)]
pub struct RopeCache {
    /// Cosine values: `[max_position, rotary_dim / 2]`.
    cos: Tensor,
    /// Sine values: `[max_position, rotary_dim / 2]`.
    sin: Tensor,
    /// Number of leading head dimensions that are rotated.
    rotary_dim: usize,
}

impl RopeCache {
    /// Pre-compute the `RoPE` tables.
    ///
    /// # Shapes
    /// - `cos`: `[max_position, rotary_dim / 2]`
    /// - `sin`: `[max_position, rotary_dim / 2]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on tensor failures.
    pub fn new(
        rotary_dim: usize,
        max_position: usize,
        theta: f64,
        scaling: Option<&RopeScaling>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let half_dim = rotary_dim / 2;

        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        let inv_freq: Vec<f32> = inverse_frequencies(rotary_dim, theta, scaling)
            .into_iter()
            .map(|f| f as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        let positions = Tensor::arange(0_u32, max_position as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_position, 1))?;

        // Outer product: [max_position, half_dim]
        let freqs = positions.matmul(&inv_freq)?;

        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
            rotary_dim,
        })
    }

    /// Number of rotated dimensions per head.
    #[must_use]
    pub const fn rotary_dim(&self) -> usize {
        self.rotary_dim
    }

    /// Apply rotary embeddings to a query or key tensor.
    ///
    /// # Shapes
    /// - `x`: `[batch, pos, heads, d_head]`
    /// - returns: `[batch, pos, heads, d_head]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) if the sequence
    /// is longer than the table or on tensor failures.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (_, seq_len, _, d_head) = x.dims4()?;
        let half_dim = self.rotary_dim / 2;

        // [1, seq_len, 1, half_dim] for broadcasting over batch and heads
        let cos = self.cos.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(2)?;
        let sin = self.sin.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(2)?;
        let cos = cos.to_dtype(x.dtype())?;
        let sin = sin.to_dtype(x.dtype())?;

        let x1 = x.narrow(D::Minus1, 0, half_dim)?;
        let x2 = x.narrow(D::Minus1, half_dim, half_dim)?;

        // [x1*cos - x2*sin, x1*sin + x2*cos]
        let rotated_x1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let rotated_x2 = (x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?;

        if self.rotary_dim == d_head {
            return Ok(Tensor::cat(&[&rotated_x1, &rotated_x2], D::Minus1)?);
        }
        let pass = x.narrow(D::Minus1, self.rotary_dim, d_head - self.rotary_dim)?;
        Ok(Tensor::cat(&[&rotated_x1, &rotated_x2, &pass], D::Minus1)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn position_zero_is_identity() {
        let rope = RopeCache::new(4, 8, 10_000.0, None, &Device::Cpu, DType::F32).unwrap();
        let x = Tensor::arange(0_f32, 6.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 1, 6))
            .unwrap();
        let y = rope.apply(&x).unwrap();
        let diff: f32 = (y - &x).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn rotation_preserves_norm_and_passthrough() {
        let rope = RopeCache::new(4, 8, 10_000.0, None, &Device::Cpu, DType::F32).unwrap();
        let x = Tensor::ones((1, 3, 2, 6), DType::F32, &Device::Cpu).unwrap();
        let y = rope.apply(&x).unwrap();
        let norm_x: f32 = x.narrow(3, 0, 4).unwrap().sqr().unwrap().sum_all().unwrap().to_scalar().unwrap();
        let norm_y: f32 = y.narrow(3, 0, 4).unwrap().sqr().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!((norm_x - norm_y).abs() < 1e-4);
        let tail: Vec<f32> = y.narrow(3, 4, 2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(tail.iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn llama3_scaling_keeps_high_and_divides_low_frequencies() {
        let scaling = RopeScaling {
            factor: 32.0,
            low_freq_factor: 1.0,
            high_freq_factor: 4.0,
            original_max_position_embeddings: 8192,
        };
        let plain = inverse_frequencies(64, 500_000.0, None);
        let scaled = inverse_frequencies(64, 500_000.0, Some(&scaling));
        assert_eq!(scaled.len(), 32);
        // i = 0: wavelength 2pi, untouched
        assert!((scaled[0] - plain[0]).abs() < 1e-12);
        // last: wavelength well past 8192, divided by the factor
        let last = plain.len() - 1;
        assert!((scaled[last] - plain[last] / 32.0).abs() < 1e-15);
        assert!(scaled.iter().zip(&plain).all(|(s, p)| s <= p));
    }

    #[test]
    fn scaled_cache_differs_from_plain_rope() {
        let scaling = RopeScaling {
            factor: 8.0,
            low_freq_factor: 1.0,
            high_freq_factor: 4.0,
            original_max_position_embeddings: 16,
        };
        let plain = RopeCache::new(8, 32, 10_000.0, None, &Device::Cpu, DType::F32).unwrap();
        let scaled =
            RopeCache::new(8, 32, 10_000.0, Some(&scaling), &Device::Cpu, DType::F32).unwrap();
        let diff: f32 = (&plain.cos - &scaled.cos)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff > 1e-3);
    }
}
