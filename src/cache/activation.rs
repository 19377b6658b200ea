// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation cache keyed by hook point.

use std::collections::HashMap;

use candle_core::{D, DType, Device, Tensor};

use super::Slice;
use crate::config::NormalizationType;
use crate::error::{LensError, Result};
use crate::hooks::{AttnHook, AttnSite, HookPoint, Layer, NormSite, Stack};

/// Model shape information kept next to the captured tensors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMetadata {
    /// Blocks per stack.
    pub n_layers: usize,
    /// Attention heads per block.
    pub n_heads: usize,
    /// Residual stream width.
    pub d_model: usize,
    /// Normalization used by the blocks (after any folding).
    pub normalization_type: NormalizationType,
    /// Whether the blocks have no MLP.
    pub attn_only: bool,
    /// Stack addressed by the layer-indexed accessors.
    pub stack: Stack,
}

/// Which components [`ActivationCache::decompose_resid`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecomposeMode {
    /// Attention and MLP outputs.
    #[default]
    All,
    /// Attention outputs only.
    Attn,
    /// MLP outputs only.
    Mlp,
}

/// Every activation captured during one forward pass.
///
/// Tensors keep the batch dimension until
/// [`remove_batch_dim`](Self::remove_batch_dim) is called; the stacking
/// accessors work with either layout.
///
/// Layer-indexed accessors address the stack in
/// [`CacheMetadata::stack`]; use [`select_stack`](Self::select_stack) to
/// switch between the encoder and decoder of an encoder-decoder model.
#[derive(Debug, Clone)]
pub struct ActivationCache {
    activations: HashMap<HookPoint, Tensor>,
    meta: CacheMetadata,
    has_batch_dim: bool,
}

impl ActivationCache {
    /// Wrap captured activations.
    #[must_use]
    pub fn new(activations: HashMap<HookPoint, Tensor>, meta: CacheMetadata) -> Self {
        Self {
            activations,
            meta,
            has_batch_dim: true,
        }
    }

    /// Shape metadata of the model that produced this cache.
    #[must_use]
    pub const fn metadata(&self) -> &CacheMetadata {
        &self.meta
    }

    /// Whether tensors still carry the batch dimension.
    #[must_use]
    pub const fn has_batch_dim(&self) -> bool {
        self.has_batch_dim
    }

    /// Address layer-indexed accessors to `stack`.
    pub fn select_stack(&mut self, stack: Stack) {
        self.meta.stack = stack;
    }

    /// Activation at `point`, if captured.
    #[must_use]
    pub fn get(&self, point: &HookPoint) -> Option<&Tensor> {
        self.activations.get(point)
    }

    /// Activation at `point`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if `point` was not captured.
    pub fn require(&self, point: &HookPoint) -> Result<&Tensor> {
        self.get(point)
            .ok_or_else(|| LensError::Hook(format!("'{point}' is not in the activation cache")))
    }

    /// Activation by dotted name, e.g. `"blocks.0.attn.hook_pattern"`.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&Tensor> {
        self.get(&HookPoint::from(name))
    }

    /// Whether `point` was captured.
    #[must_use]
    pub fn contains(&self, point: &HookPoint) -> bool {
        self.activations.contains_key(point)
    }

    /// Captured hook points, sorted by name.
    #[must_use]
    pub fn keys(&self) -> Vec<&HookPoint> {
        let mut keys: Vec<_> = self.activations.keys().collect();
        keys.sort_by_cached_key(ToString::to_string);
        keys
    }

    /// Number of captured activations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.activations.len()
    }

    /// Whether nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    /// Insert or replace an activation.
    pub fn insert(&mut self, point: HookPoint, tensor: Tensor) {
        self.activations.insert(point, tensor);
    }

    /// Drop the leading batch dimension of every tensor.
    ///
    /// Calling this on a cache without a batch dimension is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if the batch size is not 1.
    pub fn remove_batch_dim(mut self) -> Result<Self> {
        if !self.has_batch_dim {
            return Ok(self);
        }
        for (point, tensor) in &mut self.activations {
            let batch = tensor.dim(0)?;
            if batch != 1 {
                return Err(LensError::Hook(format!(
                    "cannot remove batch dimension of size {batch} at '{point}'"
                )));
            }
            *tensor = tensor.squeeze(0)?;
        }
        self.has_batch_dim = false;
        Ok(self)
    }

    /// Move every tensor to `device`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] if a transfer fails.
    pub fn to_device(self, device: &Device) -> Result<Self> {
        let activations = self
            .activations
            .into_iter()
            .map(|(point, tensor)| Ok((point, tensor.to_device(device)?)))
            .collect::<Result<_>>()?;
        Ok(Self {
            activations,
            ..self
        })
    }

    /// Stack the activation `point(layer)` for every layer of the selected
    /// stack: `[n_layers, ...]`.
    ///
    /// ```no_run
    /// # fn demo(cache: &candle_lens::ActivationCache) -> candle_lens::Result<()> {
    /// use candle_lens::HookPoint;
    /// let resid = cache.layer_activations(HookPoint::ResidPost)?;
    /// # Ok(()) }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if any layer is missing.
    pub fn layer_activations<F>(&self, point: F) -> Result<Tensor>
    where
        F: Fn(Layer) -> HookPoint,
    {
        let tensors = (0..self.meta.n_layers)
            .map(|l| self.require(&point(self.layer(l))).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&tensors, 0)?)
    }

    // --- Residual stream ---------------------------------------------------

    /// Residual stream at the start of each layer up to `layer`
    /// (`None` = all layers plus the final state).
    ///
    /// Returns `[components, (batch,) ...]` and labels `"{l}_pre"`,
    /// `"{l}_mid"` and `"final_post"`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if a required activation is missing or
    /// `layer` exceeds the number of layers.
    pub fn accumulated_resid(
        &self,
        layer: Option<usize>,
        incl_mid: bool,
        pos: &Slice,
    ) -> Result<(Tensor, Vec<String>)> {
        let layer = self.check_layer(layer)?;
        let mut components = Vec::new();
        let mut labels = Vec::new();
        for l in 0..layer {
            components.push(self.require(&HookPoint::ResidPre(self.layer(l)))?.clone());
            labels.push(format!("{l}_pre"));
            if incl_mid {
                components.push(self.require(&HookPoint::ResidMid(self.layer(l)))?.clone());
                labels.push(format!("{l}_mid"));
            }
        }
        if layer == self.meta.n_layers && layer > 0 {
            let last = self.layer(layer - 1);
            components.push(self.require(&HookPoint::ResidPost(last))?.clone());
            labels.push("final_post".to_owned());
        }
        Ok((self.stack_positions(&components, pos)?, labels))
    }

    /// Component outputs that sum to the residual stream before `layer`
    /// (`None` = the final residual stream).
    ///
    /// Embeddings (`hook_embed`, `hook_pos_embed`, `hook_token_type_embed`)
    /// are included when `incl_embeds` is set and they were captured.
    /// Decoder blocks also contribute their cross-attention output.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if a required activation is missing.
    pub fn decompose_resid(
        &self,
        layer: Option<usize>,
        mode: DecomposeMode,
        incl_embeds: bool,
        pos: &Slice,
    ) -> Result<(Tensor, Vec<String>)> {
        let layer = self.check_layer(layer)?;
        let incl_attn = mode != DecomposeMode::Mlp;
        let incl_mlp = mode != DecomposeMode::Attn && !self.meta.attn_only;

        let mut components = Vec::new();
        let mut labels = Vec::new();
        if incl_embeds && self.meta.stack != Stack::Decoder {
            for (point, label) in [
                (HookPoint::Embed, "embed"),
                (HookPoint::PosEmbed, "pos_embed"),
                (HookPoint::TokenTypeEmbed, "token_type_embed"),
            ] {
                if let Some(t) = self.get(&point) {
                    components.push(t.clone());
                    labels.push(label.to_owned());
                }
            }
        }
        for l in 0..layer {
            let at = self.layer(l);
            if incl_attn {
                components.push(self.require(&HookPoint::AttnOut(at))?.clone());
                labels.push(format!("{l}_attn_out"));
                if self.meta.stack == Stack::Decoder {
                    components.push(self.require(&HookPoint::CrossAttnOut(at))?.clone());
                    labels.push(format!("{l}_cross_attn_out"));
                }
            }
            if incl_mlp {
                components.push(self.require(&HookPoint::MlpOut(at))?.clone());
                labels.push(format!("{l}_mlp_out"));
            }
        }
        if components.is_empty() {
            return Err(LensError::Hook(
                "decompose_resid selected no components".into(),
            ));
        }
        Ok((self.stack_positions(&components, pos)?, labels))
    }

    // --- Attention heads ---------------------------------------------------

    /// Compute `hook_result` for every layer from the cached `hook_z` and
    /// the stacked output weights `w_o: [n_layers, n_heads, d_head, d_model]`.
    ///
    /// Existing results are overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if `hook_z` is missing for a layer.
    pub fn compute_head_results(&mut self, w_o: &Tensor) -> Result<()> {
        for l in 0..self.meta.n_layers {
            let at = self.layer(l);
            let z = self
                .require(&HookPoint::Attn(at, AttnSite::SelfAttn, AttnHook::Z))?
                .clone();
            let z = if self.has_batch_dim { z } else { z.unsqueeze(0)? };
            let result = head_results(&z, &w_o.get(l)?)?;
            let result = if self.has_batch_dim { result } else { result.squeeze(0)? };
            self.insert(HookPoint::Attn(at, AttnSite::SelfAttn, AttnHook::Result), result);
        }
        Ok(())
    }

    /// Per-head contributions to the residual stream before `layer`
    /// (`None` = all layers): `[n_heads * layers, (batch,) ..., d_model]`,
    /// labelled `L{l}H{h}`.
    ///
    /// Needs `hook_result` activations (from a model with
    /// `use_attn_result`, or [`compute_head_results`](Self::compute_head_results)).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if a layer's head results are missing.
    pub fn stack_head_results(
        &self,
        layer: Option<usize>,
        pos: &Slice,
    ) -> Result<(Tensor, Vec<String>)> {
        let layer = self.check_layer(layer)?;
        let head_axis = usize::from(self.has_batch_dim) + 1;
        let mut components = Vec::new();
        let mut labels = Vec::new();
        for l in 0..layer {
            let point = HookPoint::Attn(self.layer(l), AttnSite::SelfAttn, AttnHook::Result);
            let result = self.get(&point).ok_or_else(|| {
                LensError::Hook(format!(
                    "'{point}' is not cached; run compute_head_results first"
                ))
            })?;
            for h in 0..result.dim(head_axis)? {
                components.push(result.narrow(head_axis, h, 1)?.squeeze(head_axis)?);
                labels.push(format!("L{l}H{h}"));
            }
        }
        if components.is_empty() {
            return Err(LensError::Hook(
                "stack_head_results selected no layers".into(),
            ));
        }
        Ok((self.stack_positions(&components, pos)?, labels))
    }

    // --- Attribution -------------------------------------------------------

    /// Apply the cached normalization of `layer` (`None` = final norm) to
    /// a stack of residual components `[components, (batch,) ..., d_model]`.
    ///
    /// LayerNorm models are centered first; every normalizing model then
    /// divides by the cached `hook_scale`.  Identity normalization returns
    /// the stack unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if the scale was not captured.
    pub fn apply_ln_to_stack(
        &self,
        stack: &Tensor,
        layer: Option<usize>,
        pos: &Slice,
    ) -> Result<Tensor> {
        if self.meta.normalization_type == NormalizationType::Identity {
            return Ok(stack.clone());
        }
        let layer = self.check_layer(layer)?;
        let stack = if self.meta.normalization_type.centers() {
            stack.broadcast_sub(&stack.mean_keepdim(D::Minus1)?)?
        } else {
            stack.clone()
        };
        let site = if layer == self.meta.n_layers {
            NormSite::Final(self.meta.stack)
        } else {
            NormSite::Ln1(self.layer(layer))
        };
        let scale = self.require(&HookPoint::NormScale(site))?;
        let scale = pos.apply(scale, self.pos_axis())?;
        Ok(stack.broadcast_div(&scale.to_dtype(stack.dtype())?)?)
    }

    /// Dot product of each component with the unembedding direction of
    /// `tokens` (minus that of `incorrect_tokens`, if given).
    ///
    /// `stack` is `[components, ..., d_model]` (usually after
    /// [`apply_ln_to_stack`](Self::apply_ln_to_stack)); `tokens` holds
    /// token ids whose shape matches the stack's middle axes; `w_u` is
    /// `[d_model, d_vocab]`.  Returns `[components, ...]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on incompatible shapes.
    pub fn logit_attrs(
        &self,
        stack: &Tensor,
        tokens: &Tensor,
        incorrect_tokens: Option<&Tensor>,
        w_u: &Tensor,
    ) -> Result<Tensor> {
        let mut directions = residual_directions(w_u, tokens)?;
        if let Some(incorrect) = incorrect_tokens {
            directions = (directions - residual_directions(w_u, incorrect)?)?;
        }
        let directions = directions.to_dtype(stack.dtype())?;
        Ok(stack.broadcast_mul(&directions)?.sum(D::Minus1)?)
    }

    // --- Helpers -----------------------------------------------------------

    const fn layer(&self, index: usize) -> Layer {
        Layer {
            stack: self.meta.stack,
            index,
        }
    }

    /// Axis of the position dimension in residual-like activations.
    fn pos_axis(&self) -> usize {
        usize::from(self.has_batch_dim)
    }

    fn check_layer(&self, layer: Option<usize>) -> Result<usize> {
        let layer = layer.unwrap_or(self.meta.n_layers);
        if layer > self.meta.n_layers {
            return Err(LensError::Hook(format!(
                "layer {layer} exceeds the model's {} layers",
                self.meta.n_layers
            )));
        }
        Ok(layer)
    }

    fn stack_positions(&self, components: &[Tensor], pos: &Slice) -> Result<Tensor> {
        let sliced = components
            .iter()
            .map(|t| pos.apply(t, self.pos_axis()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&sliced, 0)?)
    }
}

/// `z [b, p, h, d]` and `w_o [h, d, m]` to per-head results `[b, p, h, m]`.
fn head_results(z: &Tensor, w_o: &Tensor) -> Result<Tensor> {
    let (b, p, h, d) = z.dims4()?;
    let m = w_o.dim(2)?;
    // [h, b*p, d] @ [h, d, m] -> [h, b*p, m]
    let z = z.permute((2, 0, 1, 3))?.reshape((h, b * p, d))?;
    let out = z.matmul(&w_o.to_dtype(z.dtype())?.contiguous()?)?;
    Ok(out.reshape((h, b, p, m))?.permute((1, 2, 0, 3))?.contiguous()?)
}

/// Unembedding columns of `tokens`: `tokens.dims() + [d_model]`.
fn residual_directions(w_u: &Tensor, tokens: &Tensor) -> Result<Tensor> {
    let d_model = w_u.dim(0)?;
    let flat = tokens.flatten_all()?.to_dtype(DType::U32)?;
    let directions = w_u.t()?.contiguous()?.index_select(&flat, 0)?;
    let mut shape = tokens.dims().to_vec();
    shape.push(d_model);
    Ok(directions.reshape(shape)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn meta(n_layers: usize) -> CacheMetadata {
        CacheMetadata {
            n_layers,
            n_heads: 2,
            d_model: 4,
            normalization_type: NormalizationType::LayerNormPre,
            attn_only: false,
            stack: Stack::Blocks,
        }
    }

    fn filled(v: f32) -> Tensor {
        Tensor::full(v, (1, 3, 4), &Device::Cpu).unwrap()
    }

    /// A cache whose residual stream is built from consistent components.
    fn toy_cache() -> ActivationCache {
        let mut acts = HashMap::new();
        acts.insert(HookPoint::Embed, filled(1.0));
        acts.insert(HookPoint::PosEmbed, filled(0.5));
        let mut resid = 1.5;
        for l in 0..2 {
            acts.insert(HookPoint::resid_pre(l), filled(resid));
            acts.insert(HookPoint::attn_out(l), filled(0.25));
            acts.insert(HookPoint::resid_mid(l), filled(resid + 0.25));
            acts.insert(HookPoint::mlp_out(l), filled(2.0));
            resid += 2.25;
            acts.insert(HookPoint::resid_post(l), filled(resid));
        }
        ActivationCache::new(acts, meta(2))
    }

    #[test]
    fn accumulated_resid_labels() {
        let cache = toy_cache();
        let (stack, labels) = cache.accumulated_resid(None, true, &Slice::All).unwrap();
        assert_eq!(labels, ["0_pre", "0_mid", "1_pre", "1_mid", "final_post"]);
        assert_eq!(stack.dims(), &[5, 1, 3, 4]);
    }

    #[test]
    fn decomposition_sums_to_resid() {
        let cache = toy_cache();
        let (parts, labels) = cache
            .decompose_resid(None, DecomposeMode::All, true, &Slice::last())
            .unwrap();
        assert_eq!(labels.len(), 6);
        assert_eq!(parts.dims(), &[6, 1, 4]);
        let total = parts.sum(0).unwrap();
        let resid = cache.require(&HookPoint::resid_post(1)).unwrap();
        let resid = Slice::last().apply(resid, 1).unwrap();
        let diff: f32 = (total - resid)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn missing_layer_is_error() {
        let cache = toy_cache();
        assert!(cache.accumulated_resid(Some(3), false, &Slice::All).is_err());
        assert!(cache.stack_head_results(None, &Slice::All).is_err());
    }

    #[test]
    fn head_results_from_z() {
        let mut acts = HashMap::new();
        // z = 1 everywhere, W_O[h] = (h + 1) * ones -> result[h] = 3 * (h + 1)
        acts.insert(HookPoint::z(0), Tensor::ones((1, 2, 2, 3), DType::F32, &Device::Cpu).unwrap());
        let mut cache = ActivationCache::new(acts, meta(1));
        let w_o = Tensor::new(&[1.0_f32, 2.0], &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 1, 1))
            .unwrap()
            .broadcast_as((1, 2, 3, 4))
            .unwrap()
            .contiguous()
            .unwrap();
        cache.compute_head_results(&w_o).unwrap();
        let (stack, labels) = cache.stack_head_results(None, &Slice::All).unwrap();
        assert_eq!(labels, ["L0H0", "L0H1"]);
        assert_eq!(stack.dims(), &[2, 1, 2, 4]);
        let head1: Vec<f32> = stack.get(1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(head1.iter().all(|&v| (v - 6.0).abs() < 1e-6));
    }

    #[test]
    fn ln_scale_and_logit_attrs() {
        let mut acts = HashMap::new();
        acts.insert(
            HookPoint::ln_final_scale(),
            Tensor::full(2.0_f32, (1, 3, 1), &Device::Cpu).unwrap(),
        );
        let cache = ActivationCache::new(acts, meta(0));
        let stack = Tensor::new(&[[[[1.0_f32, 3.0, 1.0, 3.0]; 3]]], &Device::Cpu).unwrap();
        let scaled = cache.apply_ln_to_stack(&stack, None, &Slice::All).unwrap();
        // centered: [-1, 1, -1, 1], divided by 2
        let row: Vec<f32> = scaled.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(&row[..4], &[-0.5, 0.5, -0.5, 0.5]);

        let w_u = Tensor::eye(4, DType::F32, &Device::Cpu).unwrap();
        let tokens = Tensor::new(&[[1u32, 1, 1]], &Device::Cpu).unwrap();
        let wrong = Tensor::new(&[[0u32, 0, 0]], &Device::Cpu).unwrap();
        let attrs = cache.logit_attrs(&scaled, &tokens, Some(&wrong), &w_u).unwrap();
        assert_eq!(attrs.dims(), &[1, 1, 3]);
        let vals: Vec<f32> = attrs.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn remove_batch_dim_requires_single_batch() {
        let cache = toy_cache().remove_batch_dim().unwrap();
        assert!(!cache.has_batch_dim());
        let (stack, _) = cache.accumulated_resid(Some(1), false, &Slice::last()).unwrap();
        assert_eq!(stack.dims(), &[1, 4]);

        let mut acts = HashMap::new();
        acts.insert(HookPoint::Embed, Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap());
        assert!(ActivationCache::new(acts, meta(0)).remove_batch_dim().is_err());
    }
}
