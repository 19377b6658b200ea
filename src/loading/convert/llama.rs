// SPDX-License-Identifier: MIT OR Apache-2.0

//! LLaMA-family checkpoints (`LlamaForCausalLM`, `MistralForCausalLM`,
//! `Qwen2ForCausalLM`).
//!
//! Separate `q/k/v/o_proj` linears, RMS norms without bias, a gated MLP
//! (`gate_proj`, `up_proj`, `down_proj`).  Qwen2 adds q/k/v biases; tied
//! checkpoints omit `lm_head.weight`.

use super::{Converted, Source};
use crate::config::HookedTransformerConfig;
use crate::error::Result;

pub(super) fn convert(
    cfg: &HookedTransformerConfig,
    src: &mut Source,
    out: &mut Converted,
) -> Result<()> {
    let (m, h, kv) = (cfg.d_model, cfg.n_heads, cfg.n_key_value_heads);

    let w_e = src.take("embed_tokens.weight")?;
    match src.take_opt("lm_head.weight")? {
        Some(lm_head) => out.put_t("unembed.W_U", &lm_head)?,
        None => out.put_t("unembed.W_U", &w_e)?,
    }
    out.put("embed.W_E", w_e);
    out.zeros("unembed.b_U", &[cfg.d_vocab_out])?;

    for l in 0..cfg.n_layers {
        let p = format!("layers.{l}");
        let b = format!("blocks.{l}");

        out.put_norm(&format!("{b}.ln1"), src.take(&format!("{p}.input_layernorm.weight"))?, None);
        out.put_norm(
            &format!("{b}.ln2"),
            src.take(&format!("{p}.post_attention_layernorm.weight"))?,
            None,
        );

        for (proj, name, heads) in [("q_proj", "Q", h), ("k_proj", "K", kv), ("v_proj", "V", kv)] {
            let w = src.take(&format!("{p}.self_attn.{proj}.weight"))?;
            out.put_in_heads(format!("{b}.attn.W_{name}"), &w, heads)?;
            let bias = src.take_opt(&format!("{p}.self_attn.{proj}.bias"))?;
            out.put_head_bias(format!("{b}.attn.b_{name}"), bias, heads)?;
        }
        out.put_out_heads(
            format!("{b}.attn.W_O"),
            &src.take(&format!("{p}.self_attn.o_proj.weight"))?,
        )?;
        out.zeros(format!("{b}.attn.b_O"), &[m])?;

        out.put_t(format!("{b}.mlp.W_gate"), &src.take(&format!("{p}.mlp.gate_proj.weight"))?)?;
        out.put_t(format!("{b}.mlp.W_in"), &src.take(&format!("{p}.mlp.up_proj.weight"))?)?;
        out.put_t(format!("{b}.mlp.W_out"), &src.take(&format!("{p}.mlp.down_proj.weight"))?)?;
        out.zeros(format!("{b}.mlp.b_in"), &[cfg.d_mlp])?;
        out.zeros(format!("{b}.mlp.b_out"), &[m])?;
    }

    out.put_norm("ln_final", src.take("norm.weight")?, None);
    Ok(())
}
