// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stacked weight accessors and QK/OV circuits shared by every model.

use candle_core::Tensor;

use crate::components::{Attention, Mlp};
use crate::error::{LensError, Result};
use crate::factored::FactoredMatrix;

/// Per-layer parameters stacked along a leading layer axis.
///
/// Implementors list their self-attention layers and MLPs in forward
/// order (encoder before decoder for encoder-decoder models) and name
/// each layer for head labels.
pub trait HookedWeights {
    /// Self-attention layers, in forward order.
    fn attention_layers(&self) -> Vec<&Attention>;

    /// MLP layers, in forward order (empty for attention-only models).
    fn mlp_layers(&self) -> Vec<&Mlp>;

    /// Label prefix of each attention layer (`L0`, `EL0`, `DL0`, ...).
    fn layer_labels(&self) -> Vec<String>;

    /// `W_Q`: `[layers, n_heads, d_model, d_head]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    fn w_q(&self) -> Result<Tensor> {
        stack(self.attention_layers(), Attention::w_q)
    }

    /// `W_K`: `[layers, n_key_value_heads, d_model, d_head]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    fn w_k(&self) -> Result<Tensor> {
        stack(self.attention_layers(), Attention::w_k)
    }

    /// `W_V`: `[layers, n_key_value_heads, d_model, d_head]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    fn w_v(&self) -> Result<Tensor> {
        stack(self.attention_layers(), Attention::w_v)
    }

    /// `W_O`: `[layers, n_heads, d_head, d_model]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    fn w_o(&self) -> Result<Tensor> {
        stack(self.attention_layers(), |a| Ok(a.w_o().clone()))
    }

    /// `b_Q`: `[layers, n_heads, d_head]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    fn b_q(&self) -> Result<Tensor> {
        stack(self.attention_layers(), Attention::b_q)
    }

    /// `b_K`: `[layers, n_key_value_heads, d_head]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    fn b_k(&self) -> Result<Tensor> {
        stack(self.attention_layers(), Attention::b_k)
    }

    /// `b_V`: `[layers, n_key_value_heads, d_head]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    fn b_v(&self) -> Result<Tensor> {
        stack(self.attention_layers(), Attention::b_v)
    }

    /// `b_O`: `[layers, d_model]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    fn b_o(&self) -> Result<Tensor> {
        stack(self.attention_layers(), |a| Ok(a.b_o().clone()))
    }

    /// `W_in`: `[layers, d_model, d_mlp]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for attention-only models.
    fn w_in(&self) -> Result<Tensor> {
        stack(self.mlp_layers(), |m| Ok(m.w_in().clone()))
    }

    /// `W_gate`: `[layers, d_model, d_mlp]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if the MLPs are not gated.
    fn w_gate(&self) -> Result<Tensor> {
        stack(self.mlp_layers(), |m| {
            m.w_gate()
                .cloned()
                .ok_or_else(|| LensError::Config("MLP has no gate".into()))
        })
    }

    /// `b_in`: `[layers, d_mlp]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for attention-only models.
    fn b_in(&self) -> Result<Tensor> {
        stack(self.mlp_layers(), |m| Ok(m.b_in().clone()))
    }

    /// `W_out`: `[layers, d_mlp, d_model]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for attention-only models.
    fn w_out(&self) -> Result<Tensor> {
        stack(self.mlp_layers(), |m| Ok(m.w_out().clone()))
    }

    /// `b_out`: `[layers, d_model]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for attention-only models.
    fn b_out(&self) -> Result<Tensor> {
        stack(self.mlp_layers(), |m| Ok(m.b_out().clone()))
    }

    /// QK circuit `W_Q W_Kᵀ`: `[layers, n_heads, d_model, d_model]`.
    ///
    /// Shared key heads are repeated to one per query head.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    fn qk(&self) -> Result<FactoredMatrix> {
        let w_q = self.w_q()?;
        let w_k = repeat_heads(&self.w_k()?, w_q.dim(1)?)?;
        FactoredMatrix::new(w_q, w_k.transpose(2, 3)?.contiguous()?)
    }

    /// OV circuit `W_V W_O`: `[layers, n_heads, d_model, d_model]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    fn ov(&self) -> Result<FactoredMatrix> {
        let w_o = self.w_o()?;
        let w_v = repeat_heads(&self.w_v()?, w_o.dim(1)?)?;
        FactoredMatrix::new(w_v, w_o)
    }

    /// `"{layer}H{head}"` for every head, layer-major.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    fn all_head_labels(&self) -> Result<Vec<String>> {
        let attns = self.attention_layers();
        let mut labels = Vec::new();
        for (prefix, attn) in self.layer_labels().iter().zip(attns) {
            let heads = attn.w_o().dim(0)?;
            labels.extend((0..heads).map(|h| format!("{prefix}H{h}")));
        }
        Ok(labels)
    }
}

fn stack<T, F>(items: Vec<&T>, f: F) -> Result<Tensor>
where
    T: ?Sized,
    F: Fn(&T) -> Result<Tensor>,
{
    if items.is_empty() {
        return Err(LensError::Config("model has no such layers".into()));
    }
    let tensors = items.into_iter().map(f).collect::<Result<Vec<_>>>()?;
    Ok(Tensor::stack(&tensors, 0)?)
}

/// `[layers, kv_heads, a, b]` → `[layers, n_heads, a, b]`, each key/value
/// head repeated for the query heads that share it.
fn repeat_heads(t: &Tensor, n_heads: usize) -> Result<Tensor> {
    let (layers, kv, a, b) = t.dims4()?;
    if kv == n_heads {
        return Ok(t.clone());
    }
    let repeats = n_heads / kv;
    Ok(t
        .unsqueeze(2)?
        .broadcast_as((layers, kv, repeats, a, b))?
        .reshape((layers, n_heads, a, b))?)
}
