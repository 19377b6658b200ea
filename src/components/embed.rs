// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token, positional and token-type embeddings, the unembedding, and the
//! masked-LM head.

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;

use crate::config::{ActivationFunction, HookedTransformerConfig, NormalizationType};
use crate::error::Result;
use crate::hooks::{HookContext, HookPoint, NormSite};

use super::mlp::activate;
use super::norm::Norm;

/// Gather rows of `table` for every id in `ids`.
///
/// # Shapes
/// - `table`: `[rows, d_model]`
/// - `ids`: `[batch, pos]`
/// - returns: `[batch, pos, d_model]`
fn lookup(table: &Tensor, ids: &Tensor) -> Result<Tensor> {
    let (batch, pos) = ids.dims2()?;
    let d_model = table.dim(1)?;
    let flat = ids.to_dtype(DType::U32)?.flatten_all()?;
    Ok(table.index_select(&flat, 0)?.reshape((batch, pos, d_model))?)
}

// ---------------------------------------------------------------------------
// Embed
// ---------------------------------------------------------------------------

/// Token embedding `W_E` (`hook_embed`).
#[derive(Debug, Clone)]
pub struct Embed {
    /// `[d_vocab, d_model]`
    w_e: Tensor,
}

impl Embed {
    /// Load `embed.W_E`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on a missing or
    /// misshapen parameter.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(cfg: &HookedTransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        Ok(Self {
            w_e: vb.get((cfg.d_vocab, cfg.d_model), "W_E")?,
        })
    }

    /// `W_E`: `[d_vocab, d_model]`.
    #[must_use]
    pub const fn w_e(&self) -> &Tensor {
        &self.w_e
    }

    /// Embed token ids `[batch, pos]` into `[batch, pos, d_model]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on out-of-range
    /// ids or tensor failures.
    pub fn forward(&self, tokens: &Tensor, ctx: &mut HookContext<'_>) -> Result<Tensor> {
        ctx.apply(HookPoint::Embed, self.embed_tokens(tokens)?)
    }

    /// Table lookup without the hook (the decoder side of a shared
    /// encoder-decoder embedding).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on out-of-range
    /// ids or tensor failures.
    pub fn embed_tokens(&self, tokens: &Tensor) -> Result<Tensor> {
        lookup(&self.w_e, tokens)
    }
}

// ---------------------------------------------------------------------------
// PosEmbed
// ---------------------------------------------------------------------------

/// Learned absolute positional embedding `W_pos` (`hook_pos_embed`).
#[derive(Debug, Clone)]
pub struct PosEmbed {
    /// `[n_ctx, d_model]`
    w_pos: Tensor,
}

impl PosEmbed {
    /// Load `pos_embed.W_pos`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on a missing or
    /// misshapen parameter.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(cfg: &HookedTransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        Ok(Self {
            w_pos: vb.get((cfg.n_ctx, cfg.d_model), "W_pos")?,
        })
    }

    /// `W_pos`: `[n_ctx, d_model]`.
    #[must_use]
    pub const fn w_pos(&self) -> &Tensor {
        &self.w_pos
    }

    /// Positional embedding for `[batch, pos]` tokens.
    ///
    /// With an attention mask, positions count only real tokens, so
    /// left-padded sequences start at position 0 at their first real token.
    ///
    /// # Shapes
    /// - `tokens`: `[batch, pos]`
    /// - `attention_mask`: `[batch, pos]`, `1` = real token
    /// - returns: `[batch, pos, d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) if the sequence
    /// exceeds `n_ctx`.
    pub fn forward(
        &self,
        tokens: &Tensor,
        attention_mask: Option<&Tensor>,
        ctx: &mut HookContext<'_>,
    ) -> Result<Tensor> {
        let (batch, pos) = tokens.dims2()?;
        let positions = match attention_mask {
            None => {
                #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
                let end = pos as u32;
                Tensor::arange(0_u32, end, tokens.device())?
                    .unsqueeze(0)?
                    .broadcast_as((batch, pos))?
                    .contiguous()?
            }
            Some(mask) => {
                let counts = mask.to_dtype(DType::F32)?.cumsum(1)?;
                (counts - 1.0)?.clamp(0.0_f32, f32::MAX)?.to_dtype(DType::U32)?
            }
        };
        ctx.apply(HookPoint::PosEmbed, lookup(&self.w_pos, &positions)?)
    }
}

// ---------------------------------------------------------------------------
// TokenTypeEmbed
// ---------------------------------------------------------------------------

/// Segment embedding of an encoder (`hook_token_type_embed`).
#[derive(Debug, Clone)]
pub struct TokenTypeEmbed {
    /// `[2, d_model]`
    w_token_type: Tensor,
}

impl TokenTypeEmbed {
    /// Load `token_type_embed.W_token_type`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on a missing or
    /// misshapen parameter.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(cfg: &HookedTransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        Ok(Self {
            w_token_type: vb.get((2, cfg.d_model), "W_token_type")?,
        })
    }

    /// Embed token-type ids; `None` means all zeros.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on tensor failures.
    pub fn forward(
        &self,
        tokens: &Tensor,
        token_type_ids: Option<&Tensor>,
        ctx: &mut HookContext<'_>,
    ) -> Result<Tensor> {
        let ids = match token_type_ids {
            Some(ids) => ids.clone(),
            None => tokens.zeros_like()?,
        };
        ctx.apply(HookPoint::TokenTypeEmbed, lookup(&self.w_token_type, &ids)?)
    }
}

// ---------------------------------------------------------------------------
// Unembed
// ---------------------------------------------------------------------------

/// Map the residual stream to vocabulary logits.
#[derive(Debug, Clone)]
pub struct Unembed {
    /// `[d_model, d_vocab_out]`
    w_u: Tensor,
    /// `[d_vocab_out]`
    b_u: Tensor,
}

impl Unembed {
    /// Load `unembed.W_U` and `unembed.b_U`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on a missing or
    /// misshapen parameter.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(cfg: &HookedTransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        Ok(Self {
            w_u: vb.get((cfg.d_model, cfg.d_vocab_out), "W_U")?,
            b_u: vb.get(cfg.d_vocab_out, "b_U")?,
        })
    }

    /// `W_U`: `[d_model, d_vocab_out]`.
    #[must_use]
    pub const fn w_u(&self) -> &Tensor {
        &self.w_u
    }

    /// `b_U`: `[d_vocab_out]`.
    #[must_use]
    pub const fn b_u(&self) -> &Tensor {
        &self.b_u
    }

    /// # Shapes
    /// - `x`: `[batch, pos, d_model]`
    /// - returns: `[batch, pos, d_vocab_out]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on tensor failures.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.broadcast_matmul(&self.w_u)?.broadcast_add(&self.b_u)?)
    }
}

// ---------------------------------------------------------------------------
// MlmHead
// ---------------------------------------------------------------------------

/// Masked-LM transform of an encoder: dense, GELU, layer norm.
#[derive(Debug, Clone)]
pub struct MlmHead {
    /// `[d_model, d_model]`
    w: Tensor,
    /// `[d_model]`
    b: Tensor,
    act: ActivationFunction,
    ln: Norm,
}

impl MlmHead {
    /// Load `mlm_head.W`, `mlm_head.b` and `mlm_head.ln`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on a missing or
    /// misshapen parameter.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(cfg: &HookedTransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        Ok(Self {
            w: vb.get((cfg.d_model, cfg.d_model), "W")?,
            b: vb.get(cfg.d_model, "b")?,
            act: cfg.act_fn,
            ln: Norm::load(
                NormalizationType::LayerNorm,
                cfg.d_model,
                cfg.eps,
                NormSite::MlmHead,
                vb.pp("ln"),
            )?,
        })
    }

    /// Hook points this head exposes.
    pub fn hook_points(&self, out: &mut Vec<HookPoint>) {
        self.ln.hook_points(out);
    }

    /// # Shapes
    /// - `x`: `[batch, pos, d_model]`
    /// - returns: `[batch, pos, d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on tensor
    /// failures and propagates hook errors.
    pub fn forward(&self, x: &Tensor, ctx: &mut HookContext<'_>) -> Result<Tensor> {
        let h = x.broadcast_matmul(&self.w)?.broadcast_add(&self.b)?;
        let h = activate(&h, self.act)?;
        self.ln.forward(&h, ctx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use candle_core::Device;

    use super::*;
    use crate::hooks::HookSpec;

    #[test]
    fn pos_embed_respects_left_padding() {
        let dev = Device::Cpu;
        let cfg = HookedTransformerConfig::new(1, 2, 4, 1, 2, 5);
        let table = Tensor::new(&[[0.0_f32, 0.0], [1.0, 1.0], [2.0, 2.0], [3.0, 3.0]], &dev).unwrap();
        let mut map = HashMap::new();
        map.insert("pos_embed.W_pos".to_string(), table);
        let vb = VarBuilder::from_tensors(map, DType::F32, &dev);
        let pos = PosEmbed::load(&cfg, vb.pp("pos_embed")).unwrap();

        let tokens = Tensor::new(&[[7_u32, 7, 3]], &dev).unwrap();
        let mask = Tensor::new(&[[0_u32, 1, 1]], &dev).unwrap();
        let spec = HookSpec::new();
        let mut ctx = HookContext::new(Vec::new(), &spec);
        let out = pos.forward(&tokens, Some(&mask), &mut ctx).unwrap();
        let firsts: Vec<f32> = out.narrow(2, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(firsts, vec![0.0, 0.0, 1.0]);

        let plain = pos.forward(&tokens, None, &mut ctx).unwrap();
        let firsts: Vec<f32> = plain.narrow(2, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(firsts, vec![0.0, 1.0, 2.0]);
    }
}
