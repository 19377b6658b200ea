// SPDX-License-Identifier: MIT OR Apache-2.0

//! `GPTNeoXForCausalLM` (Pythia) checkpoints.
//!
//! The fused `query_key_value` projection interleaves heads first:
//! its rows are `(head, [q | k | v], d_head)`.

use super::{Converted, Source};
use crate::config::HookedTransformerConfig;
use crate::error::Result;

pub(super) fn convert(
    cfg: &HookedTransformerConfig,
    src: &mut Source,
    out: &mut Converted,
) -> Result<()> {
    let (m, h, d) = (cfg.d_model, cfg.n_heads, cfg.d_head);

    out.put("embed.W_E", src.take("embed_in.weight")?);

    for l in 0..cfg.n_layers {
        let p = format!("layers.{l}");
        let b = format!("blocks.{l}");

        let w = src.take(&format!("{p}.input_layernorm.weight"))?;
        let bias = src.take(&format!("{p}.input_layernorm.bias"))?;
        out.put_norm(&format!("{b}.ln1"), w, Some(bias));
        let w = src.take(&format!("{p}.post_attention_layernorm.weight"))?;
        let bias = src.take(&format!("{p}.post_attention_layernorm.bias"))?;
        out.put_norm(&format!("{b}.ln2"), w, Some(bias));

        let qkv = src
            .take(&format!("{p}.attention.query_key_value.weight"))?
            .reshape((h, 3, d, m))?;
        let qkv_b = src
            .take(&format!("{p}.attention.query_key_value.bias"))?
            .reshape((h, 3, d))?;
        for (i, name) in ["Q", "K", "V"].into_iter().enumerate() {
            let w = qkv.narrow(1, i, 1)?.squeeze(1)?.transpose(1, 2)?.contiguous()?;
            out.put(format!("{b}.attn.W_{name}"), w);
            let bias = qkv_b.narrow(1, i, 1)?.squeeze(1)?.contiguous()?;
            out.put(format!("{b}.attn.b_{name}"), bias);
        }
        out.put_out_heads(
            format!("{b}.attn.W_O"),
            &src.take(&format!("{p}.attention.dense.weight"))?,
        )?;
        out.put(format!("{b}.attn.b_O"), src.take(&format!("{p}.attention.dense.bias"))?);

        out.put_t(format!("{b}.mlp.W_in"), &src.take(&format!("{p}.mlp.dense_h_to_4h.weight"))?)?;
        out.put(format!("{b}.mlp.b_in"), src.take(&format!("{p}.mlp.dense_h_to_4h.bias"))?);
        out.put_t(format!("{b}.mlp.W_out"), &src.take(&format!("{p}.mlp.dense_4h_to_h.weight"))?)?;
        out.put(format!("{b}.mlp.b_out"), src.take(&format!("{p}.mlp.dense_4h_to_h.bias"))?);
    }

    let w = src.take("final_layer_norm.weight")?;
    let bias = src.take("final_layer_norm.bias")?;
    out.put_norm("ln_final", w, Some(bias));
    out.put_t("unembed.W_U", &src.take("embed_out.weight")?)?;
    out.zeros("unembed.b_U", &[cfg.d_vocab_out])?;
    Ok(())
}
