// SPDX-License-Identifier: MIT OR Apache-2.0

//! Normalization layers with `hook_scale` / `hook_normalized`.
//!
//! One [`Norm`] type covers every [`NormalizationType`]: the variant decides
//! whether the mean is subtracted and which affine parameters exist.  The
//! statistics are computed in `F32` whatever the activation dtype.

use candle_core::{D, DType, Tensor};
use candle_nn::VarBuilder;

use crate::config::NormalizationType;
use crate::error::Result;
use crate::hooks::{HookContext, HookPoint, NormSite};

/// A normalization layer bound to its hook site.
#[derive(Debug, Clone)]
pub struct Norm {
    kind: NormalizationType,
    /// Weight `[d_model]` (LN and RMS only).
    w: Option<Tensor>,
    /// Bias `[d_model]` (LN only).
    b: Option<Tensor>,
    eps: f64,
    site: NormSite,
}

impl Norm {
    /// Load a norm layer.  `vb` points at the layer prefix (e.g. `blocks.0.ln1`).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) if a parameter
    /// is missing or has the wrong shape.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(
        kind: NormalizationType,
        d_model: usize,
        eps: f64,
        site: NormSite,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        let w = if kind.has_weight() {
            Some(vb.get(d_model, "w")?)
        } else {
            None
        };
        let b = if kind.has_bias() {
            Some(vb.get(d_model, "b")?)
        } else {
            None
        };
        Ok(Self {
            kind,
            w,
            b,
            eps,
            site,
        })
    }

    /// Normalization variant.
    #[must_use]
    pub const fn kind(&self) -> NormalizationType {
        self.kind
    }

    /// Learned weight, if any.
    #[must_use]
    pub const fn weight(&self) -> Option<&Tensor> {
        self.w.as_ref()
    }

    /// Learned bias, if any.
    #[must_use]
    pub const fn bias(&self) -> Option<&Tensor> {
        self.b.as_ref()
    }

    /// Hook points this layer exposes.
    pub fn hook_points(&self, out: &mut Vec<HookPoint>) {
        if self.kind != NormalizationType::Identity {
            out.push(HookPoint::NormScale(self.site));
            out.push(HookPoint::NormNormalized(self.site));
        }
    }

    /// Normalize `x`.
    ///
    /// # Shapes
    /// - `x`: `[batch, pos, d_model]`
    /// - `hook_scale`: `[batch, pos, 1]`
    /// - returns: `[batch, pos, d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on tensor
    /// failures and propagates hook errors.
    pub fn forward(&self, x: &Tensor, ctx: &mut HookContext<'_>) -> Result<Tensor> {
        if self.kind == NormalizationType::Identity {
            return Ok(x.clone());
        }
        let dtype = x.dtype();
        // PROMOTE: variance in half precision loses too much; compute in F32
        let mut x32 = x.to_dtype(DType::F32)?;
        if self.kind.centers() {
            x32 = x32.broadcast_sub(&x32.mean_keepdim(D::Minus1)?)?;
        }
        let scale = (x32.sqr()?.mean_keepdim(D::Minus1)? + self.eps)?.sqrt()?;
        let scale = ctx.apply(HookPoint::NormScale(self.site), scale)?;

        let normalized = x32.broadcast_div(&scale)?.to_dtype(dtype)?;
        let mut out = ctx.apply(HookPoint::NormNormalized(self.site), normalized)?;
        if let Some(w) = &self.w {
            out = out.broadcast_mul(w)?;
        }
        if let Some(b) = &self.b {
            out = out.broadcast_add(b)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use candle_core::Device;

    use super::*;
    use crate::hooks::{HookSpec, Stack};

    fn vb_with(w: &[f32], b: &[f32]) -> VarBuilder<'static> {
        let mut map = HashMap::new();
        map.insert("ln.w".to_string(), Tensor::new(w, &Device::Cpu).unwrap());
        map.insert("ln.b".to_string(), Tensor::new(b, &Device::Cpu).unwrap());
        VarBuilder::from_tensors(map, DType::F32, &Device::Cpu)
    }

    #[test]
    fn layer_norm_matches_formula() {
        let vb = vb_with(&[1.0, 2.0, 1.0, 1.0], &[0.0, 0.0, 0.0, 1.0]);
        let norm = Norm::load(
            NormalizationType::LayerNorm,
            4,
            1e-5,
            NormSite::Final(Stack::Blocks),
            vb.pp("ln"),
        )
        .unwrap();
        let x = Tensor::new(&[[[1.0_f32, 2.0, 3.0, 4.0]]], &Device::Cpu).unwrap();

        let mut spec = HookSpec::new();
        spec.capture(HookPoint::ln_final_scale());
        let mut ctx = HookContext::new(Vec::new(), &spec);
        let y: Vec<f32> = norm.forward(&x, &mut ctx).unwrap().flatten_all().unwrap().to_vec1().unwrap();

        // mean 2.5, var 1.25
        let s = (1.25_f32 + 1e-5).sqrt();
        let expected = [-1.5 / s, 2.0 * -0.5 / s, 0.5 / s, 1.5 / s + 1.0];
        for (a, e) in y.iter().zip(expected) {
            assert!((a - e).abs() < 1e-5, "{a} vs {e}");
        }
        let cache = ctx.finish(x);
        let scale = cache.require(&HookPoint::ln_final_scale()).unwrap();
        assert_eq!(scale.dims(), &[1, 1, 1]);
    }

    #[test]
    fn rms_pre_does_not_center() {
        let vb = vb_with(&[1.0, 1.0], &[0.0, 0.0]);
        let norm = Norm::load(
            NormalizationType::RmsNormPre,
            2,
            0.0,
            NormSite::Final(Stack::Blocks),
            vb.pp("ln"),
        )
        .unwrap();
        assert!(norm.weight().is_none());
        let x = Tensor::new(&[[[3.0_f32, 4.0]]], &Device::Cpu).unwrap();
        let spec = HookSpec::new();
        let mut ctx = HookContext::new(Vec::new(), &spec);
        let y: Vec<f32> = norm.forward(&x, &mut ctx).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let rms = 12.5_f32.sqrt();
        assert!((y[0] - 3.0 / rms).abs() < 1e-6);
        assert!((y[1] - 4.0 / rms).abs() < 1e-6);
    }
}
