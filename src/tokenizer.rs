// SPDX-License-Identifier: MIT OR Apache-2.0

//! Thin wrapper around a `HuggingFace` tokenizer.
//!
//! Adds the pieces the hooked models need on top of `tokenizers`:
//! explicit BOS handling, per-token strings, and batched encoding into a
//! padded `[batch, pos]` tensor with its attention mask.
//!
//! # Example
//!
//! ```no_run
//! use candle_lens::LensTokenizer;
//!
//! # fn main() -> candle_lens::Result<()> {
//! let tok = LensTokenizer::from_file("tokenizer.json", Some(50256))?;
//! let ids = tok.encode("Hello world", true)?;
//! assert_eq!(ids[0], 50256);
//! let pieces = tok.str_tokens(&ids)?;
//! assert_eq!(pieces.len(), ids.len());
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::error::{LensError, Result};

/// Which side of a short sequence receives padding in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingSide {
    /// Pad after the last real token.
    #[default]
    Right,
    /// Pad before the first real token.
    Left,
}

/// A padded batch of token ids.
#[derive(Debug, Clone)]
pub struct TokenBatch {
    /// `[batch, pos]` `u32` ids.
    pub tokens: Tensor,
    /// `[batch, pos]` `u32`, `1` for real tokens and `0` for padding.
    pub attention_mask: Tensor,
}

/// `HuggingFace` tokenizer with BOS bookkeeping.
pub struct LensTokenizer {
    inner: Box<tokenizers::Tokenizer>,
    bos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
}

impl LensTokenizer {
    /// Load a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>, bos_token_id: Option<u32>) -> Result<Self> {
        let path = path.as_ref();
        let tok = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            LensError::Tokenizer(format!("failed to load tokenizer from {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "loaded tokenizer");
        Ok(Self::from_hf(tok, bos_token_id))
    }

    /// Wrap an already-loaded tokenizer.
    #[must_use]
    pub fn from_hf(tokenizer: tokenizers::Tokenizer, bos_token_id: Option<u32>) -> Self {
        let pad_token_id = tokenizer.get_padding().map(|p| p.pad_id);
        Self {
            inner: Box::new(tokenizer),
            bos_token_id,
            pad_token_id,
        }
    }

    /// BOS token id, if known.
    #[must_use]
    pub const fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    /// Id used for padding: the configured pad token, else BOS, else 0.
    #[must_use]
    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id.or(self.bos_token_id).unwrap_or(0)
    }

    /// Vocabulary size including added tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Encode `text` without the tokenizer's own special tokens, then
    /// prepend BOS when asked and known.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if encoding fails.
    pub fn encode(&self, text: &str, prepend_bos: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| LensError::Tokenizer(format!("encode failed: {e}")))?;
        let mut ids = Vec::with_capacity(encoding.len() + 1);
        if prepend_bos {
            if let Some(bos) = self.bos_token_id {
                ids.push(bos);
            }
        }
        ids.extend_from_slice(encoding.get_ids());
        Ok(ids)
    }

    /// Encode several strings into one padded batch.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] on encoding failures and
    /// [`LensError::Model`] on tensor failures.
    pub fn encode_batch(
        &self,
        texts: &[&str],
        prepend_bos: bool,
        padding_side: PaddingSide,
        device: &Device,
    ) -> Result<TokenBatch> {
        let encoded = texts
            .iter()
            .map(|t| self.encode(t, prepend_bos))
            .collect::<Result<Vec<_>>>()?;
        pad_batch(&encoded, self.pad_token_id(), padding_side, device)
    }

    /// Decode ids into one string.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if decoding fails.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| LensError::Tokenizer(format!("decode failed: {e}")))
    }

    /// Decode each id on its own.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if decoding fails.
    pub fn str_tokens(&self, ids: &[u32]) -> Result<Vec<String>> {
        ids.iter().map(|&id| self.decode(&[id])).collect()
    }

    /// The id of `text` when it is exactly one token.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if `text` encodes to zero or
    /// several tokens.
    pub fn single_token(&self, text: &str) -> Result<u32> {
        match self.encode(text, false)?.as_slice() {
            [id] => Ok(*id),
            ids => Err(LensError::Tokenizer(format!(
                "'{text}' is {} tokens, expected exactly one",
                ids.len()
            ))),
        }
    }
}

impl std::fmt::Debug for LensTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LensTokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("bos_token_id", &self.bos_token_id)
            .finish_non_exhaustive()
    }
}

/// Pad variable-length id lists into `[batch, max_len]`.
///
/// # Errors
///
/// Returns [`LensError::Tokenizer`] for an empty batch and
/// [`LensError::Model`] on tensor failures.
pub fn pad_batch(
    sequences: &[Vec<u32>],
    pad_id: u32,
    side: PaddingSide,
    device: &Device,
) -> Result<TokenBatch> {
    let max_len = sequences.iter().map(Vec::len).max().unwrap_or(0);
    if max_len == 0 {
        return Err(LensError::Tokenizer("cannot build a batch of empty sequences".into()));
    }
    let mut ids = Vec::with_capacity(sequences.len() * max_len);
    let mut mask = Vec::with_capacity(sequences.len() * max_len);
    for seq in sequences {
        let pad = max_len - seq.len();
        if side == PaddingSide::Left {
            ids.extend(std::iter::repeat_n(pad_id, pad));
            mask.extend(std::iter::repeat_n(0_u32, pad));
        }
        ids.extend_from_slice(seq);
        mask.extend(std::iter::repeat_n(1_u32, seq.len()));
        if side == PaddingSide::Right {
            ids.extend(std::iter::repeat_n(pad_id, pad));
            mask.extend(std::iter::repeat_n(0_u32, pad));
        }
    }
    let shape = (sequences.len(), max_len);
    Ok(TokenBatch {
        tokens: Tensor::from_vec(ids, shape, device)?,
        attention_mask: Tensor::from_vec(mask, shape, device)?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn right_padding_masks_the_tail() {
        let batch = pad_batch(&[vec![5, 6, 7], vec![8]], 0, PaddingSide::Right, &Device::Cpu).unwrap();
        let tokens: Vec<Vec<u32>> = batch.tokens.to_vec2().unwrap();
        let mask: Vec<Vec<u32>> = batch.attention_mask.to_vec2().unwrap();
        assert_eq!(tokens, vec![vec![5, 6, 7], vec![8, 0, 0]]);
        assert_eq!(mask, vec![vec![1, 1, 1], vec![1, 0, 0]]);
    }

    #[test]
    fn left_padding_masks_the_head() {
        let batch = pad_batch(&[vec![1], vec![2, 3]], 9, PaddingSide::Left, &Device::Cpu).unwrap();
        let tokens: Vec<Vec<u32>> = batch.tokens.to_vec2().unwrap();
        let mask: Vec<Vec<u32>> = batch.attention_mask.to_vec2().unwrap();
        assert_eq!(tokens, vec![vec![9, 1], vec![2, 3]]);
        assert_eq!(mask, vec![vec![0, 1], vec![1, 1]]);
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(pad_batch(&[], 0, PaddingSide::Right, &Device::Cpu).is_err());
    }
}
