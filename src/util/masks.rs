// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention masks.
//!
//! Masks are additive: `0.0` where attention is allowed and `-inf` where
//! it is not.  Causal masks are cached by `(seq_len, device, dtype)` so a
//! forward pass over many layers builds each mask once.  The cache holds at
//! most [`MAX_CACHED_MASKS`] entries and is emptied when it fills up.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, PoisonError};

use candle_core::{DType, Device, Tensor};

use crate::error::Result;

/// Cache key: `(seq_len, device kind, dtype)`.
type MaskKey = (usize, usize, DType);

/// Upper bound on the number of cached causal masks.
pub const MAX_CACHED_MASKS: usize = 16;

static CAUSAL_MASK_CACHE: LazyLock<Mutex<HashMap<MaskKey, Tensor>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Device kind for the cache key.
const fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Causal mask of shape `[1, 1, seq_len, seq_len]`.
///
/// ```text
/// [[0, -inf, -inf],
///  [0,    0, -inf],
///  [0,    0,    0]]
/// ```
///
/// # Errors
///
/// Returns [`LensError::Model`](crate::LensError::Model) on tensor creation failure.
pub fn causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let key = (seq_len, device_id(device), dtype);
    {
        let cache = CAUSAL_MASK_CACHE
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = cache.get(&key) {
            if cached.device().same_device(device) {
                return Ok(cached.clone());
            }
        }
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    let mut cache = CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if cache.len() >= MAX_CACHED_MASKS && !cache.contains_key(&key) {
        cache.clear();
    }
    cache.insert(key, mask.clone());
    drop(cache);
    Ok(mask)
}

/// Additive key-padding mask from a `[batch, key_pos]` 0/1 attention mask.
///
/// # Shapes
/// - `attention_mask`: `[batch, key_pos]`, any numeric dtype, `1` = real token
/// - returns: `[batch, 1, 1, key_pos]`
///
/// # Errors
///
/// Returns [`LensError::Model`](crate::LensError::Model) on tensor failures.
pub fn padding_mask(attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (batch, key_pos) = attention_mask.dims2()?;
    let keep = attention_mask.to_dtype(DType::F32)?;
    let zeros = keep.zeros_like()?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, (batch, key_pos), attention_mask.device())?;
    let mask = keep.gt(&zeros)?.where_cond(&zeros, &neg_inf)?;
    Ok(mask.reshape((batch, 1, 1, key_pos))?.to_dtype(dtype)?)
}

/// Replace NaN entries (rows with every key masked) by zero.
///
/// # Errors
///
/// Returns [`LensError::Model`](crate::LensError::Model) on tensor failures.
pub fn zero_nans(pattern: &Tensor) -> Result<Tensor> {
    let is_nan = pattern.ne(pattern)?;
    Ok(is_nan.where_cond(&pattern.zeros_like()?, pattern)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn causal_mask_layout() {
        let mask = causal_mask(3, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let rows: Vec<Vec<f32>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1].is_infinite());
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0]);
        // Second call comes from the cache with the same contents.
        let again = causal_mask(3, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(again.dims(), mask.dims());
    }

    #[test]
    fn causal_mask_cache_is_bounded() {
        for len in 1..=3 * MAX_CACHED_MASKS {
            let mask = causal_mask(len, &Device::Cpu, DType::F32).unwrap();
            assert_eq!(mask.dims(), &[1, 1, len, len]);
        }
        let cached = CAUSAL_MASK_CACHE
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        assert!(cached <= MAX_CACHED_MASKS, "{cached} masks cached");
    }

    #[test]
    fn padding_mask_blocks_zero_positions() {
        let am = Tensor::new(&[[0_u32, 1, 1], [1, 1, 1]], &Device::Cpu).unwrap();
        let mask = padding_mask(&am, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[2, 1, 1, 3]);
        let flat: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        assert!(flat[0].is_infinite());
        assert_eq!(&flat[1..], &[0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn nans_become_zero() {
        let t = Tensor::new(&[f32::NAN, 0.5], &Device::Cpu).unwrap();
        let z: Vec<f32> = zero_nans(&t).unwrap().to_vec1().unwrap();
        assert_eq!(z, vec![0.0, 0.5]);
    }
}
