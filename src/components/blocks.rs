// SPDX-License-Identifier: MIT OR Apache-2.0

//! Residual blocks.
//!
//! - [`TransformerBlock`]: pre-norm decoder block, sequential or parallel
//!   attention/MLP, optionally attention-only.
//! - [`BertBlock`]: post-norm encoder block.
//! - [`T5Block`]: RMS pre-norm block; decoder blocks add cross attention.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::{HookedTransformerConfig, NormalizationType};
use crate::error::{LensError, Result};
use crate::hooks::{AttnSite, HookContext, HookPoint, Layer, NormSite, Stack};

use super::attention::{AttnInputs, Attention};
use super::mlp::Mlp;
use super::norm::Norm;

// ---------------------------------------------------------------------------
// TransformerBlock
// ---------------------------------------------------------------------------

/// Pre-norm block of a decoder-only model.
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    ln1: Norm,
    attn: Attention,
    /// `None` for attention-only models.
    mlp: Option<(Norm, Mlp)>,
    parallel: bool,
    layer: Layer,
}

impl TransformerBlock {
    /// Load block `index`.  `vb` points at `blocks.{index}`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on a missing or misshapen parameter.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(cfg: &HookedTransformerConfig, index: usize, vb: VarBuilder<'_>) -> Result<Self> {
        let layer = Layer::blocks(index);
        let norm = |site, name| {
            Norm::load(cfg.normalization_type, cfg.d_model, cfg.eps, site, vb.pp(name))
        };
        let mlp = if cfg.attn_only {
            None
        } else {
            Some((norm(NormSite::Ln2(layer), "ln2")?, Mlp::load(cfg, layer, vb.pp("mlp"))?))
        };
        Ok(Self {
            ln1: norm(NormSite::Ln1(layer), "ln1")?,
            attn: Attention::load(cfg, layer, AttnSite::SelfAttn, vb.pp("attn"))?,
            mlp,
            parallel: cfg.parallel_attn_mlp,
            layer,
        })
    }

    /// Attention sublayer.
    #[must_use]
    pub const fn attn(&self) -> &Attention {
        &self.attn
    }

    /// MLP sublayer, absent for attention-only models.
    #[must_use]
    pub fn mlp(&self) -> Option<&Mlp> {
        self.mlp.as_ref().map(|(_, mlp)| mlp)
    }

    /// First norm (before attention).
    #[must_use]
    pub const fn ln1(&self) -> &Norm {
        &self.ln1
    }

    /// Second norm (before the MLP).
    #[must_use]
    pub fn ln2(&self) -> Option<&Norm> {
        self.mlp.as_ref().map(|(ln, _)| ln)
    }

    /// Hook points of this block, in forward order.
    pub fn hook_points(&self, out: &mut Vec<HookPoint>) {
        let l = self.layer;
        out.push(HookPoint::ResidPre(l));
        self.ln1.hook_points(out);
        self.attn.hook_points(out);
        out.push(HookPoint::AttnOut(l));
        if let Some((ln2, mlp)) = &self.mlp {
            if !self.parallel {
                out.push(HookPoint::ResidMid(l));
            }
            ln2.hook_points(out);
            mlp.hook_points(out);
            out.push(HookPoint::MlpOut(l));
        }
        out.push(HookPoint::ResidPost(l));
    }

    /// # Shapes
    /// - `x`: `[batch, pos, d_model]`
    /// - returns: `[batch, pos, d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures and propagates hook
    /// errors.
    pub fn forward(
        &self,
        x: Tensor,
        inputs: AttnInputs<'_>,
        ctx: &mut HookContext<'_>,
    ) -> Result<Tensor> {
        let l = self.layer;
        let resid_pre = ctx.apply(HookPoint::ResidPre(l), x)?;

        let attn_in = self.ln1.forward(&resid_pre, ctx)?;
        let attn_out = self.attn.forward(&attn_in, &attn_in, inputs, ctx)?;
        let attn_out = ctx.apply(HookPoint::AttnOut(l), attn_out)?;

        let Some((ln2, mlp)) = &self.mlp else {
            return ctx.apply(HookPoint::ResidPost(l), (resid_pre + attn_out)?);
        };

        let resid_post = if self.parallel {
            let mlp_out = mlp.forward(&ln2.forward(&resid_pre, ctx)?, ctx)?;
            let mlp_out = ctx.apply(HookPoint::MlpOut(l), mlp_out)?;
            ((resid_pre + attn_out)? + mlp_out)?
        } else {
            let resid_mid = ctx.apply(HookPoint::ResidMid(l), (resid_pre + attn_out)?)?;
            let mlp_out = mlp.forward(&ln2.forward(&resid_mid, ctx)?, ctx)?;
            let mlp_out = ctx.apply(HookPoint::MlpOut(l), mlp_out)?;
            (resid_mid + mlp_out)?
        };
        ctx.apply(HookPoint::ResidPost(l), resid_post)
    }
}

// ---------------------------------------------------------------------------
// BertBlock
// ---------------------------------------------------------------------------

/// Post-norm encoder block.
#[derive(Debug, Clone)]
pub struct BertBlock {
    attn: Attention,
    ln1: Norm,
    mlp: Mlp,
    ln2: Norm,
    layer: Layer,
}

impl BertBlock {
    /// Load block `index`.  `vb` points at `blocks.{index}`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on a missing or misshapen parameter.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(cfg: &HookedTransformerConfig, index: usize, vb: VarBuilder<'_>) -> Result<Self> {
        let layer = Layer::blocks(index);
        let norm = |site, name| {
            Norm::load(NormalizationType::LayerNorm, cfg.d_model, cfg.eps, site, vb.pp(name))
        };
        Ok(Self {
            attn: Attention::load(cfg, layer, AttnSite::SelfAttn, vb.pp("attn"))?,
            ln1: norm(NormSite::Ln1(layer), "ln1")?,
            mlp: Mlp::load(cfg, layer, vb.pp("mlp"))?,
            ln2: norm(NormSite::Ln2(layer), "ln2")?,
            layer,
        })
    }

    /// Attention sublayer.
    #[must_use]
    pub const fn attn(&self) -> &Attention {
        &self.attn
    }

    /// MLP sublayer.
    #[must_use]
    pub const fn mlp(&self) -> &Mlp {
        &self.mlp
    }

    /// Hook points of this block, in forward order.
    pub fn hook_points(&self, out: &mut Vec<HookPoint>) {
        let l = self.layer;
        out.push(HookPoint::ResidPre(l));
        self.attn.hook_points(out);
        out.push(HookPoint::AttnOut(l));
        out.push(HookPoint::ResidMid(l));
        self.ln1.hook_points(out);
        out.push(HookPoint::NormalizedResidMid(l));
        self.mlp.hook_points(out);
        out.push(HookPoint::MlpOut(l));
        out.push(HookPoint::ResidPost(l));
        self.ln2.hook_points(out);
        out.push(HookPoint::NormalizedResidPost(l));
    }

    /// # Shapes
    /// - `x`: `[batch, pos, d_model]`
    /// - returns: `[batch, pos, d_model]` (the normalized residual)
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures and propagates hook
    /// errors.
    pub fn forward(
        &self,
        x: Tensor,
        inputs: AttnInputs<'_>,
        ctx: &mut HookContext<'_>,
    ) -> Result<Tensor> {
        let l = self.layer;
        let resid_pre = ctx.apply(HookPoint::ResidPre(l), x)?;
        let attn_out = self.attn.forward(&resid_pre, &resid_pre, inputs, ctx)?;
        let attn_out = ctx.apply(HookPoint::AttnOut(l), attn_out)?;
        let resid_mid = ctx.apply(HookPoint::ResidMid(l), (resid_pre + attn_out)?)?;
        let normalized_mid = self.ln1.forward(&resid_mid, ctx)?;
        let normalized_mid = ctx.apply(HookPoint::NormalizedResidMid(l), normalized_mid)?;

        let mlp_out = self.mlp.forward(&normalized_mid, ctx)?;
        let mlp_out = ctx.apply(HookPoint::MlpOut(l), mlp_out)?;
        let resid_post = ctx.apply(HookPoint::ResidPost(l), (normalized_mid + mlp_out)?)?;
        let normalized_post = self.ln2.forward(&resid_post, ctx)?;
        ctx.apply(HookPoint::NormalizedResidPost(l), normalized_post)
    }
}

// ---------------------------------------------------------------------------
// T5Block
// ---------------------------------------------------------------------------

/// RMS pre-norm block of an encoder-decoder model.
#[derive(Debug, Clone)]
pub struct T5Block {
    ln1: Norm,
    attn: Attention,
    /// Decoder blocks only.
    cross: Option<(Norm, Attention)>,
    ln_mlp: Norm,
    mlp: Mlp,
    layer: Layer,
}

impl T5Block {
    /// Load block `index` of `stack`.  `vb` points at `{stack}.{index}`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on a missing or misshapen parameter and
    /// [`LensError::Config`] for [`Stack::Blocks`].
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(
        cfg: &HookedTransformerConfig,
        stack: Stack,
        index: usize,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        let layer = match stack {
            Stack::Encoder => Layer::encoder(index),
            Stack::Decoder => Layer::decoder(index),
            Stack::Blocks => {
                return Err(LensError::Config(
                    "T5 blocks live in the encoder or decoder stack".into(),
                ));
            }
        };
        let norm = |site, name| {
            Norm::load(cfg.normalization_type, cfg.d_model, cfg.eps, site, vb.pp(name))
        };
        let (cross, ln_mlp) = if stack == Stack::Decoder {
            let cross_attn = Attention::load(cfg, layer, AttnSite::CrossAttn, vb.pp("cross_attn"))?;
            (
                Some((norm(NormSite::Ln2(layer), "ln2")?, cross_attn)),
                norm(NormSite::Ln3(layer), "ln3")?,
            )
        } else {
            (None, norm(NormSite::Ln2(layer), "ln2")?)
        };
        Ok(Self {
            ln1: norm(NormSite::Ln1(layer), "ln1")?,
            attn: Attention::load(cfg, layer, AttnSite::SelfAttn, vb.pp("attn"))?,
            cross,
            ln_mlp,
            mlp: Mlp::load(cfg, layer, vb.pp("mlp"))?,
            layer,
        })
    }

    /// Self-attention sublayer.
    #[must_use]
    pub const fn attn(&self) -> &Attention {
        &self.attn
    }

    /// Cross-attention sublayer (decoder blocks).
    #[must_use]
    pub fn cross_attn(&self) -> Option<&Attention> {
        self.cross.as_ref().map(|(_, attn)| attn)
    }

    /// MLP sublayer.
    #[must_use]
    pub const fn mlp(&self) -> &Mlp {
        &self.mlp
    }

    /// Hook points of this block, in forward order.
    pub fn hook_points(&self, out: &mut Vec<HookPoint>) {
        let l = self.layer;
        out.push(HookPoint::ResidPre(l));
        self.ln1.hook_points(out);
        self.attn.hook_points(out);
        out.push(HookPoint::AttnOut(l));
        out.push(HookPoint::ResidMid(l));
        if let Some((ln2, cross)) = &self.cross {
            ln2.hook_points(out);
            cross.hook_points(out);
            out.push(HookPoint::CrossAttnOut(l));
            out.push(HookPoint::ResidMidCross(l));
        }
        self.ln_mlp.hook_points(out);
        self.mlp.hook_points(out);
        out.push(HookPoint::MlpOut(l));
        out.push(HookPoint::ResidPost(l));
    }

    /// # Shapes
    /// - `x`: `[batch, pos, d_model]`
    /// - `encoder_out`: `[batch, enc_pos, d_model]` (decoder blocks)
    /// - returns: `[batch, pos, d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if a decoder block gets no encoder
    /// output, [`LensError::Model`] on tensor failures, and propagates hook
    /// errors.
    pub fn forward(
        &self,
        x: Tensor,
        self_inputs: AttnInputs<'_>,
        encoder_out: Option<(&Tensor, AttnInputs<'_>)>,
        ctx: &mut HookContext<'_>,
    ) -> Result<Tensor> {
        let l = self.layer;
        let resid_pre = ctx.apply(HookPoint::ResidPre(l), x)?;
        let attn_in = self.ln1.forward(&resid_pre, ctx)?;
        let attn_out = self.attn.forward(&attn_in, &attn_in, self_inputs, ctx)?;
        let attn_out = ctx.apply(HookPoint::AttnOut(l), attn_out)?;
        let mut resid = ctx.apply(HookPoint::ResidMid(l), (resid_pre + attn_out)?)?;

        if let Some((ln2, cross)) = &self.cross {
            let (enc, cross_inputs) = encoder_out.ok_or_else(|| {
                LensError::Config(format!("decoder block {l} needs the encoder output"))
            })?;
            let cross_in = ln2.forward(&resid, ctx)?;
            let cross_out = cross.forward(&cross_in, enc, cross_inputs, ctx)?;
            let cross_out = ctx.apply(HookPoint::CrossAttnOut(l), cross_out)?;
            resid = ctx.apply(HookPoint::ResidMidCross(l), (resid + cross_out)?)?;
        }

        let mlp_out = self.mlp.forward(&self.ln_mlp.forward(&resid, ctx)?, ctx)?;
        let mlp_out = ctx.apply(HookPoint::MlpOut(l), mlp_out)?;
        ctx.apply(HookPoint::ResidPost(l), (resid + mlp_out)?)
    }
}
