// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feed-forward layers.
//!
//! Two layouts share one struct:
//! - plain: `act(x W_in + b_in) W_out + b_out`
//! - gated: `(act(x W_gate) * (x W_in + b_in)) W_out + b_out`

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::{ActivationFunction, HookedTransformerConfig};
use crate::error::Result;
use crate::hooks::{HookContext, HookPoint, Layer};

/// MLP layer with `hook_pre`, `hook_pre_linear` (gated) and `hook_post`.
#[derive(Debug, Clone)]
pub struct Mlp {
    /// `[d_model, d_mlp]`
    w_in: Tensor,
    /// `[d_mlp]`
    b_in: Tensor,
    /// `[d_model, d_mlp]`, gated layout only.
    w_gate: Option<Tensor>,
    /// `[d_mlp, d_model]`
    w_out: Tensor,
    /// `[d_model]`
    b_out: Tensor,
    act: ActivationFunction,
    layer: Layer,
}

impl Mlp {
    /// Load MLP weights.  `vb` points at `{layer}.mlp`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) if a parameter
    /// is missing or misshapen.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(cfg: &HookedTransformerConfig, layer: Layer, vb: VarBuilder<'_>) -> Result<Self> {
        let (m, d_mlp) = (cfg.d_model, cfg.d_mlp);
        let w_gate = if cfg.gated_mlp {
            Some(vb.get((m, d_mlp), "W_gate")?)
        } else {
            None
        };
        Ok(Self {
            w_in: vb.get((m, d_mlp), "W_in")?,
            b_in: vb.get(d_mlp, "b_in")?,
            w_gate,
            w_out: vb.get((d_mlp, m), "W_out")?,
            b_out: vb.get(m, "b_out")?,
            act: cfg.act_fn,
            layer,
        })
    }

    /// `W_in`: `[d_model, d_mlp]`.
    #[must_use]
    pub const fn w_in(&self) -> &Tensor {
        &self.w_in
    }

    /// `b_in`: `[d_mlp]`.
    #[must_use]
    pub const fn b_in(&self) -> &Tensor {
        &self.b_in
    }

    /// `W_gate`: `[d_model, d_mlp]` for gated MLPs.
    #[must_use]
    pub const fn w_gate(&self) -> Option<&Tensor> {
        self.w_gate.as_ref()
    }

    /// `W_out`: `[d_mlp, d_model]`.
    #[must_use]
    pub const fn w_out(&self) -> &Tensor {
        &self.w_out
    }

    /// `b_out`: `[d_model]`.
    #[must_use]
    pub const fn b_out(&self) -> &Tensor {
        &self.b_out
    }

    /// Hook points this layer exposes.
    pub fn hook_points(&self, out: &mut Vec<HookPoint>) {
        out.push(HookPoint::MlpPre(self.layer));
        if self.w_gate.is_some() {
            out.push(HookPoint::MlpPreLinear(self.layer));
        }
        out.push(HookPoint::MlpPost(self.layer));
    }

    /// Run the MLP.
    ///
    /// # Shapes
    /// - `x`: `[batch, pos, d_model]`
    /// - returns: `[batch, pos, d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on tensor
    /// failures and propagates hook errors.
    pub fn forward(&self, x: &Tensor, ctx: &mut HookContext<'_>) -> Result<Tensor> {
        let post = match &self.w_gate {
            None => {
                let pre = x.broadcast_matmul(&self.w_in)?.broadcast_add(&self.b_in)?;
                let pre = ctx.apply(HookPoint::MlpPre(self.layer), pre)?;
                activate(&pre, self.act)?
            }
            Some(w_gate) => {
                let pre = ctx.apply(HookPoint::MlpPre(self.layer), x.broadcast_matmul(w_gate)?)?;
                let pre_linear = x.broadcast_matmul(&self.w_in)?.broadcast_add(&self.b_in)?;
                let pre_linear = ctx.apply(HookPoint::MlpPreLinear(self.layer), pre_linear)?;
                (activate(&pre, self.act)? * pre_linear)?
            }
        };
        let post = ctx.apply(HookPoint::MlpPost(self.layer), post)?;
        Ok(post.broadcast_matmul(&self.w_out)?.broadcast_add(&self.b_out)?)
    }
}

/// Apply an activation function elementwise.
///
/// # Errors
///
/// Returns [`LensError::Model`](crate::LensError::Model) on tensor failures.
pub fn activate(x: &Tensor, act: ActivationFunction) -> Result<Tensor> {
    Ok(match act {
        ActivationFunction::Gelu => x.gelu_erf()?,
        ActivationFunction::GeluNew => x.gelu()?,
        ActivationFunction::Relu => x.relu()?,
        ActivationFunction::Silu => x.silu()?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device};

    use super::*;
    use crate::hooks::HookSpec;

    fn tiny_cfg(gated: bool) -> HookedTransformerConfig {
        let mut cfg = HookedTransformerConfig::new(1, 2, 4, 1, 2, 5);
        cfg.d_mlp = 3;
        cfg.gated_mlp = gated;
        cfg.act_fn = ActivationFunction::Relu;
        cfg
    }

    fn weights(gated: bool) -> VarBuilder<'static> {
        let dev = Device::Cpu;
        let mut map = HashMap::new();
        map.insert(
            "mlp.W_in".into(),
            Tensor::new(&[[1.0_f32, -1.0, 0.5], [0.0, 1.0, 0.5]], &dev).unwrap(),
        );
        map.insert("mlp.b_in".into(), Tensor::zeros(3, DType::F32, &dev).unwrap());
        map.insert(
            "mlp.W_out".into(),
            Tensor::new(&[[1.0_f32, 0.0], [0.0, 1.0], [1.0, 1.0]], &dev).unwrap(),
        );
        map.insert("mlp.b_out".into(), Tensor::new(&[0.0_f32, 1.0], &dev).unwrap());
        if gated {
            map.insert("mlp.W_gate".into(), Tensor::ones((2, 3), DType::F32, &dev).unwrap());
        }
        VarBuilder::from_tensors(map, DType::F32, &dev)
    }

    #[test]
    fn plain_mlp_forward() {
        let mlp = Mlp::load(&tiny_cfg(false), Layer::blocks(0), weights(false).pp("mlp")).unwrap();
        let x = Tensor::new(&[[[2.0_f32, 1.0]]], &Device::Cpu).unwrap();
        let spec = HookSpec::new();
        let mut ctx = HookContext::new(Vec::new(), &spec);
        let y: Vec<f32> = mlp.forward(&x, &mut ctx).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        // pre = [2, -1, 1.5] -> relu [2, 0, 1.5] -> out [3.5, 1.5] + [0, 1]
        assert_eq!(y, vec![3.5, 2.5]);
    }

    #[test]
    fn gated_mlp_exposes_pre_linear() {
        let mlp = Mlp::load(&tiny_cfg(true), Layer::blocks(0), weights(true).pp("mlp")).unwrap();
        let mut points = Vec::new();
        mlp.hook_points(&mut points);
        assert_eq!(points.len(), 3);
        let x = Tensor::new(&[[[2.0_f32, 1.0]]], &Device::Cpu).unwrap();
        let mut spec = HookSpec::new();
        spec.capture(HookPoint::MlpPreLinear(Layer::blocks(0)));
        let mut ctx = HookContext::new(Vec::new(), &spec);
        let y: Vec<f32> = mlp.forward(&x, &mut ctx).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        // gate = relu([3,3,3]); linear = [2,-1,1.5]; post = [6,-3,4.5]
        assert_eq!(y, vec![10.5, 2.5]);
        assert_eq!(ctx.finish(x).num_captures(), 1);
    }
}
