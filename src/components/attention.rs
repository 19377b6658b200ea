// SPDX-License-Identifier: MIT OR Apache-2.0

//! Multi-head attention with per-head weights and hooks.
//!
//! Weights use the per-head layout (`W_Q: [n_heads, d_model, d_head]`,
//! `W_O: [n_heads, d_head, d_model]`).  At load time the query, key and
//! value weights are flattened into `[d_model, heads * d_head]` matrices
//! so the projection is a single matmul; the accessors return per-head
//! views.  Covers self and cross attention, causal and bidirectional
//! masking, rotary embeddings, T5 relative position bias, and
//! grouped-query attention.

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;

use crate::config::{HookedTransformerConfig, PositionalEmbeddingType};
use crate::error::Result;
use crate::hooks::{AttnHook, AttnSite, HookContext, HookPoint, Layer};
use crate::util::masks::zero_nans;

use super::rope::RopeCache;

// ---------------------------------------------------------------------------
// Per-call inputs
// ---------------------------------------------------------------------------

/// Shared, per-forward inputs of an attention layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttnInputs<'a> {
    /// Additive mask broadcastable to `[batch, head, query_pos, key_pos]`.
    pub mask: Option<&'a Tensor>,
    /// Whether the mask can blank a whole row (padding), in which case
    /// the resulting NaNs are zeroed.
    pub has_padding: bool,
    /// Rotary tables, when the model uses rotary positions.
    pub rope: Option<&'a RopeCache>,
    /// Relative position bias `[1, head, query_pos, key_pos]`.
    pub position_bias: Option<&'a Tensor>,
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

/// Attention layer with hook points `hook_q` .. `hook_result`.
#[derive(Debug, Clone)]
pub struct Attention {
    /// `[d_model, n_heads * d_head]`
    w_q: Tensor,
    /// `[n_heads * d_head]`
    b_q: Tensor,
    /// `[d_model, n_kv_heads * d_head]`
    w_k: Tensor,
    /// `[n_kv_heads * d_head]`
    b_k: Tensor,
    /// `[d_model, n_kv_heads * d_head]`
    w_v: Tensor,
    /// `[n_kv_heads * d_head]`
    b_v: Tensor,
    /// `[n_heads, d_head, d_model]`
    w_o: Tensor,
    /// `[d_model]`
    b_o: Tensor,
    n_heads: usize,
    n_kv_heads: usize,
    d_head: usize,
    d_model: usize,
    scale: f64,
    use_attn_result: bool,
    rotary: bool,
    layer: Layer,
    site: AttnSite,
}

impl Attention {
    /// Load attention weights.  `vb` points at `{layer}.attn` or
    /// `{layer}.cross_attn`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) if a parameter
    /// is missing or misshapen.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(
        cfg: &HookedTransformerConfig,
        layer: Layer,
        site: AttnSite,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        let (h, kv, m, d) = (cfg.n_heads, cfg.n_key_value_heads, cfg.d_model, cfg.d_head);

        let w_q = flatten_in(&vb.get((h, m, d), "W_Q")?)?;
        let w_k = flatten_in(&vb.get((kv, m, d), "W_K")?)?;
        let w_v = flatten_in(&vb.get((kv, m, d), "W_V")?)?;
        let b_q = vb.get((h, d), "b_Q")?.flatten_all()?;
        let b_k = vb.get((kv, d), "b_K")?.flatten_all()?;
        let b_v = vb.get((kv, d), "b_V")?.flatten_all()?;
        let w_o = vb.get((h, d, m), "W_O")?.contiguous()?;
        let b_o = vb.get(m, "b_O")?;

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let scale = if cfg.use_attn_scale {
            1.0 / (d as f64).sqrt()
        } else {
            1.0
        };
        let rotary = site == AttnSite::SelfAttn
            && cfg.positional_embedding_type == PositionalEmbeddingType::Rotary;

        Ok(Self {
            w_q,
            b_q,
            w_k,
            b_k,
            w_v,
            b_v,
            w_o,
            b_o,
            n_heads: h,
            n_kv_heads: kv,
            d_head: d,
            d_model: m,
            scale,
            use_attn_result: cfg.use_attn_result,
            rotary,
            layer,
            site,
        })
    }

    fn point(&self, hook: AttnHook) -> HookPoint {
        HookPoint::Attn(self.layer, self.site, hook)
    }

    // --- Weight accessors (per-head views) --------------------------------

    /// `W_Q`: `[n_heads, d_model, d_head]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on reshape failure.
    pub fn w_q(&self) -> Result<Tensor> {
        unflatten_in(&self.w_q, self.n_heads, self.d_model, self.d_head)
    }

    /// `W_K`: `[n_kv_heads, d_model, d_head]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on reshape failure.
    pub fn w_k(&self) -> Result<Tensor> {
        unflatten_in(&self.w_k, self.n_kv_heads, self.d_model, self.d_head)
    }

    /// `W_V`: `[n_kv_heads, d_model, d_head]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on reshape failure.
    pub fn w_v(&self) -> Result<Tensor> {
        unflatten_in(&self.w_v, self.n_kv_heads, self.d_model, self.d_head)
    }

    /// `W_O`: `[n_heads, d_head, d_model]`.
    #[must_use]
    pub const fn w_o(&self) -> &Tensor {
        &self.w_o
    }

    /// `b_Q`: `[n_heads, d_head]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on reshape failure.
    pub fn b_q(&self) -> Result<Tensor> {
        Ok(self.b_q.reshape((self.n_heads, self.d_head))?)
    }

    /// `b_K`: `[n_kv_heads, d_head]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on reshape failure.
    pub fn b_k(&self) -> Result<Tensor> {
        Ok(self.b_k.reshape((self.n_kv_heads, self.d_head))?)
    }

    /// `b_V`: `[n_kv_heads, d_head]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on reshape failure.
    pub fn b_v(&self) -> Result<Tensor> {
        Ok(self.b_v.reshape((self.n_kv_heads, self.d_head))?)
    }

    /// `b_O`: `[d_model]`.
    #[must_use]
    pub const fn b_o(&self) -> &Tensor {
        &self.b_o
    }

    /// Hook points this layer exposes, in forward order.
    pub fn hook_points(&self, out: &mut Vec<HookPoint>) {
        out.push(self.point(AttnHook::Q));
        out.push(self.point(AttnHook::K));
        out.push(self.point(AttnHook::V));
        if self.rotary {
            out.push(self.point(AttnHook::RotQ));
            out.push(self.point(AttnHook::RotK));
        }
        out.push(self.point(AttnHook::Scores));
        out.push(self.point(AttnHook::Pattern));
        out.push(self.point(AttnHook::Z));
        if self.use_attn_result {
            out.push(self.point(AttnHook::Result));
        }
    }

    /// Run attention.
    ///
    /// # Shapes
    /// - `x`: `[batch, query_pos, d_model]` (query source)
    /// - `kv_source`: `[batch, key_pos, d_model]` (same as `x` for self attention)
    /// - returns: `[batch, query_pos, d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on tensor
    /// failures and propagates hook errors.
    pub fn forward(
        &self,
        x: &Tensor,
        kv_source: &Tensor,
        inputs: AttnInputs<'_>,
        ctx: &mut HookContext<'_>,
    ) -> Result<Tensor> {
        let (batch, q_len, _) = x.dims3()?;
        let k_len = kv_source.dim(1)?;

        // --- Projections: [batch, pos, heads, d_head] ---
        let q = project(x, &self.w_q, &self.b_q)?.reshape((batch, q_len, self.n_heads, self.d_head))?;
        let k = project(kv_source, &self.w_k, &self.b_k)?
            .reshape((batch, k_len, self.n_kv_heads, self.d_head))?;
        let v = project(kv_source, &self.w_v, &self.b_v)?
            .reshape((batch, k_len, self.n_kv_heads, self.d_head))?;
        let mut q = ctx.apply(self.point(AttnHook::Q), q)?;
        let mut k = ctx.apply(self.point(AttnHook::K), k)?;
        let v = ctx.apply(self.point(AttnHook::V), v)?;

        if self.rotary {
            if let Some(rope) = inputs.rope {
                q = ctx.apply(self.point(AttnHook::RotQ), rope.apply(&q)?)?;
                k = ctx.apply(self.point(AttnHook::RotK), rope.apply(&k)?)?;
            }
        }

        // --- Scores: [batch, head, q, k] ---
        // CONTIGUOUS: transpose produces non-unit strides; matmul requires contiguous layout
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = repeat_kv(k.transpose(1, 2)?, self.n_heads, self.n_kv_heads)?;
        let v = repeat_kv(v.transpose(1, 2)?, self.n_heads, self.n_kv_heads)?.contiguous()?;
        let k_t = k.transpose(2, 3)?.contiguous()?;

        let mut scores = (q.matmul(&k_t)? * self.scale)?;
        if let Some(bias) = inputs.position_bias {
            scores = scores.broadcast_add(&bias.to_dtype(scores.dtype())?)?;
        }
        if let Some(mask) = inputs.mask {
            scores = scores.broadcast_add(&mask.to_dtype(scores.dtype())?)?;
        }
        let scores = ctx.apply(self.point(AttnHook::Scores), scores)?;

        // PROMOTE: softmax over F16/BF16 can produce NaN; compute in F32
        let original_dtype = scores.dtype();
        let mut pattern = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?;
        if inputs.has_padding {
            pattern = zero_nans(&pattern)?;
        }
        let pattern = ctx.apply(self.point(AttnHook::Pattern), pattern.to_dtype(original_dtype)?)?;

        // --- Mix values: z [batch, q, head, d_head] ---
        let z = pattern.contiguous()?.matmul(&v)?.transpose(1, 2)?.contiguous()?;
        let z = ctx.apply(self.point(AttnHook::Z), z)?;

        // --- Output ---
        if self.use_attn_result {
            let result = self.head_results(&z)?;
            let result = ctx.apply(self.point(AttnHook::Result), result)?;
            return Ok(result.sum(2)?.broadcast_add(&self.b_o)?);
        }
        let z_flat = z.reshape((batch, q_len, self.n_heads * self.d_head))?;
        let w_o_flat = self.w_o.reshape((self.n_heads * self.d_head, self.d_model))?;
        Ok(z_flat.broadcast_matmul(&w_o_flat)?.broadcast_add(&self.b_o)?)
    }

    /// Per-head outputs `z_h W_O[h]` without the bias.
    ///
    /// # Shapes
    /// - `z`: `[batch, pos, head, d_head]`
    /// - returns: `[batch, pos, head, d_model]`
    fn head_results(&self, z: &Tensor) -> Result<Tensor> {
        let (batch, pos, heads, d_head) = z.dims4()?;
        // [head, batch * pos, d_head] @ [head, d_head, d_model]
        let z_h = z
            .permute((2, 0, 1, 3))?
            .contiguous()?
            .reshape((heads, batch * pos, d_head))?;
        let out = z_h.matmul(&self.w_o)?;
        Ok(out
            .reshape((heads, batch, pos, self.d_model))?
            .permute((1, 2, 0, 3))?
            .contiguous()?)
    }
}

// ---------------------------------------------------------------------------
// Relative position bias (T5)
// ---------------------------------------------------------------------------

/// Bucketed relative position bias shared by every layer of a T5 stack.
#[derive(Debug, Clone)]
pub struct RelativePositionBias {
    /// `[num_buckets, n_heads]`
    table: Tensor,
    num_buckets: usize,
    max_distance: usize,
    bidirectional: bool,
}

impl RelativePositionBias {
    /// Load `rel_pos_bias` from the first attention layer of a stack.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) if the table
    /// is missing or misshapen.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(
        cfg: &HookedTransformerConfig,
        bidirectional: bool,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        Ok(Self {
            table: vb.get(
                (cfg.relative_attention_num_buckets, cfg.n_heads),
                "rel_pos_bias",
            )?,
            num_buckets: cfg.relative_attention_num_buckets,
            max_distance: cfg.relative_attention_max_distance,
            bidirectional,
        })
    }

    /// Bias for every query/key pair.
    ///
    /// # Shapes
    /// - returns: `[1, n_heads, query_len, key_len]`
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`](crate::LensError::Model) on tensor failures.
    pub fn forward(&self, query_len: usize, key_len: usize) -> Result<Tensor> {
        let buckets: Vec<u32> = (0..query_len)
            .flat_map(|q| {
                (0..key_len).map(move |k| {
                    #[allow(clippy::cast_possible_wrap, clippy::as_conversions)]
                    let relative = k as i64 - q as i64;
                    relative
                })
            })
            .map(|rel| {
                let bucket = relative_position_bucket(
                    rel,
                    self.bidirectional,
                    self.num_buckets,
                    self.max_distance,
                );
                #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
                let b = bucket as u32;
                b
            })
            .collect();
        let idx = Tensor::from_vec(buckets, query_len * key_len, self.table.device())?;
        let n_heads = self.table.dim(1)?;
        Ok(self
            .table
            .index_select(&idx, 0)?
            .reshape((query_len, key_len, n_heads))?
            .permute((2, 0, 1))?
            .unsqueeze(0)?
            .contiguous()?)
    }
}

/// T5 bucket for `relative = key_pos - query_pos`.
///
/// Half the buckets (per direction when bidirectional) cover exact small
/// distances; the rest grow logarithmically up to `max_distance`, beyond
/// which everything shares the last bucket.
#[must_use]
pub fn relative_position_bucket(
    relative: i64,
    bidirectional: bool,
    num_buckets: usize,
    max_distance: usize,
) -> usize {
    let mut n = num_buckets;
    let mut bucket = 0;
    let distance = if bidirectional {
        n /= 2;
        if relative > 0 {
            bucket += n;
        }
        relative.unsigned_abs()
    } else {
        // Only the past is visible: distance = max(-relative, 0).
        (-relative.min(0)).unsigned_abs()
    };
    let max_exact = n / 2;
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    let distance = distance as usize;
    if distance < max_exact {
        return bucket + distance;
    }
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::as_conversions
    )]
    let large = {
        let ratio = (distance as f32 / max_exact as f32).ln()
            / (max_distance as f32 / max_exact as f32).ln();
        max_exact + (ratio * (n - max_exact) as f32) as usize
    };
    bucket + large.min(n - 1)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `[heads, d_model, d_head]` → `[d_model, heads * d_head]`.
fn flatten_in(w: &Tensor) -> Result<Tensor> {
    let (heads, d_model, d_head) = w.dims3()?;
    Ok(w.permute((1, 0, 2))?.contiguous()?.reshape((d_model, heads * d_head))?)
}

/// `[d_model, heads * d_head]` → `[heads, d_model, d_head]`.
fn unflatten_in(w: &Tensor, heads: usize, d_model: usize, d_head: usize) -> Result<Tensor> {
    Ok(w.reshape((d_model, heads, d_head))?.permute((1, 0, 2))?.contiguous()?)
}

/// `x W + b` over the last axis.
fn project(x: &Tensor, w: &Tensor, b: &Tensor) -> Result<Tensor> {
    Ok(x.broadcast_matmul(w)?.broadcast_add(b)?)
}

/// Expand key/value tensors from `n_kv_heads` to `n_heads` for GQA.
///
/// # Shapes
/// - `x`: `[batch, n_kv_heads, seq, head_dim]`
/// - returns: `[batch, n_heads, seq, head_dim]`
///
/// When `n_heads == n_kv_heads` (MHA), returns the input unchanged.
fn repeat_kv(x: Tensor, n_heads: usize, n_kv_heads: usize) -> Result<Tensor> {
    if n_heads == n_kv_heads {
        return Ok(x);
    }
    let repeats = n_heads / n_kv_heads;
    let (batch, _kv_heads, seq_len, head_dim) = x.dims4()?;

    // [batch, n_kv_heads, 1, seq, head_dim] → repeat → [batch, n_heads, seq, head_dim]
    let x = x
        .unsqueeze(2)?
        .expand((batch, n_kv_heads, repeats, seq_len, head_dim))?
        .reshape((batch, n_heads, seq_len, head_dim))?;
    Ok(x)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn bidirectional_buckets() {
        let b = |rel| relative_position_bucket(rel, true, 32, 128);
        assert_eq!(b(0), 0);
        assert_eq!(b(-1), 1);
        assert_eq!(b(1), 17);
        assert_eq!(b(7), 23);
        assert_eq!(b(-7), 7);
        assert_eq!(b(8), 24);
        assert_eq!(b(-8), 8);
        assert_eq!(b(127), 31);
        assert_eq!(b(200), 31);
        assert_eq!(b(-200), 15);
    }

    #[test]
    fn causal_buckets() {
        let b = |rel| relative_position_bucket(rel, false, 32, 128);
        assert_eq!(b(5), 0);
        assert_eq!(b(0), 0);
        assert_eq!(b(-1), 1);
        assert_eq!(b(-15), 15);
        assert_eq!(b(-16), 16);
        assert_eq!(b(-20), 17);
        assert_eq!(b(-1000), 31);
    }

    #[test]
    fn repeat_kv_expands_heads() {
        let x = Tensor::arange(0_f32, 4.0, &candle_core::Device::Cpu)
            .unwrap()
            .reshape((1, 2, 1, 2))
            .unwrap();
        let y = repeat_kv(x, 4, 2).unwrap();
        assert_eq!(y.dims(), &[1, 4, 1, 2]);
        let v: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(v, vec![0.0, 1.0, 0.0, 1.0, 2.0, 3.0, 2.0, 3.0]);
    }

    #[test]
    fn flatten_roundtrip() {
        let w = Tensor::arange(0_f32, 24.0, &candle_core::Device::Cpu)
            .unwrap()
            .reshape((2, 3, 4))
            .unwrap();
        let flat = flatten_in(&w).unwrap();
        assert_eq!(flat.dims(), &[3, 8]);
        let back = unflatten_in(&flat, 2, 3, 4).unwrap();
        let diff: f32 = (back - &w).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }
}
