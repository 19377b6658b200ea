// SPDX-License-Identifier: MIT OR Apache-2.0

//! `T5ForConditionalGeneration` checkpoints.
//!
//! Each block is a list of sublayers: `layer.0` self attention, then
//! `layer.1` cross attention (decoder only), then the feed-forward
//! sublayer.  Only block 0 of each stack stores the relative position
//! bias table.

use super::{Converted, Source};
use crate::config::HookedTransformerConfig;
use crate::error::Result;

fn attention(
    src: &mut Source,
    out: &mut Converted,
    from: &str,
    to: &str,
    heads: usize,
    d_model: usize,
) -> Result<()> {
    for (proj, name) in [("q", "Q"), ("k", "K"), ("v", "V")] {
        let w = src.take(&format!("{from}.{proj}.weight"))?;
        out.put_in_heads(format!("{to}.W_{name}"), &w, heads)?;
        out.put_head_bias(format!("{to}.b_{name}"), None, heads)?;
    }
    out.put_out_heads(format!("{to}.W_O"), &src.take(&format!("{from}.o.weight"))?)?;
    out.zeros(format!("{to}.b_O"), &[d_model])
}

pub(super) fn convert(
    cfg: &HookedTransformerConfig,
    src: &mut Source,
    out: &mut Converted,
) -> Result<()> {
    let (m, h) = (cfg.d_model, cfg.n_heads);

    let shared = src.take("shared.weight")?;
    let lm_head = if cfg.tie_word_embeddings {
        None
    } else {
        src.take_opt("lm_head.weight")?
    };
    match lm_head {
        Some(w) => out.put_t("unembed.W_U", &w)?,
        None => {
            // Tied checkpoints rescale the decoder output by d_model^-0.5.
            #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
            let scale = (m as f64).powf(-0.5);
            out.put("unembed.W_U", (shared.t()?.contiguous()? * scale)?);
        }
    }
    out.zeros("unembed.b_U", &[cfg.d_vocab_out])?;
    out.put("embed.W_E", shared);

    for (stack, decoder) in [("encoder", false), ("decoder", true)] {
        for l in 0..cfg.n_layers {
            let p = format!("{stack}.block.{l}");
            let b = format!("{stack}.{l}");

            attention(src, out, &format!("{p}.layer.0.SelfAttention"), &format!("{b}.attn"), h, m)?;
            if l == 0 {
                out.put(
                    format!("{b}.attn.rel_pos_bias"),
                    src.take(&format!("{p}.layer.0.SelfAttention.relative_attention_bias.weight"))?,
                );
            }
            out.put_norm(&format!("{b}.ln1"), src.take(&format!("{p}.layer.0.layer_norm.weight"))?, None);

            let ff = if decoder {
                attention(
                    src,
                    out,
                    &format!("{p}.layer.1.EncDecAttention"),
                    &format!("{b}.cross_attn"),
                    h,
                    m,
                )?;
                out.put_norm(&format!("{b}.ln2"), src.take(&format!("{p}.layer.1.layer_norm.weight"))?, None);
                out.put_norm(&format!("{b}.ln3"), src.take(&format!("{p}.layer.2.layer_norm.weight"))?, None);
                format!("{p}.layer.2.DenseReluDense")
            } else {
                out.put_norm(&format!("{b}.ln2"), src.take(&format!("{p}.layer.1.layer_norm.weight"))?, None);
                format!("{p}.layer.1.DenseReluDense")
            };

            if cfg.gated_mlp {
                out.put_t(format!("{b}.mlp.W_gate"), &src.take(&format!("{ff}.wi_0.weight"))?)?;
                out.put_t(format!("{b}.mlp.W_in"), &src.take(&format!("{ff}.wi_1.weight"))?)?;
            } else {
                out.put_t(format!("{b}.mlp.W_in"), &src.take(&format!("{ff}.wi.weight"))?)?;
            }
            out.put_t(format!("{b}.mlp.W_out"), &src.take(&format!("{ff}.wo.weight"))?)?;
            out.zeros(format!("{b}.mlp.b_in"), &[cfg.d_mlp])?;
            out.zeros(format!("{b}.mlp.b_out"), &[m])?;
        }
        out.put_norm(
            &format!("{stack}_final_ln"),
            src.take(&format!("{stack}.final_layer_norm.weight"))?,
            None,
        );
    }
    Ok(())
}
