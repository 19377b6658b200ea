// SPDX-License-Identifier: MIT OR Apache-2.0

//! `BertForMaskedLM` checkpoints.
//!
//! Older checkpoints name layer-norm parameters `gamma`/`beta`; the
//! masked-LM decoder is usually tied to the word embeddings.

use super::{Converted, Source};
use crate::config::HookedTransformerConfig;
use crate::error::Result;

/// Layer norm under `prefix`, accepting both naming schemes.
fn layer_norm(src: &mut Source, out: &mut Converted, prefix: &str, to: &str) -> Result<()> {
    let w = src.take_any(&[&*format!("{prefix}.weight"), &*format!("{prefix}.gamma")])?;
    let b = src.take_any(&[&*format!("{prefix}.bias"), &*format!("{prefix}.beta")])?;
    out.put_norm(to, w, Some(b));
    Ok(())
}

pub(super) fn convert(
    cfg: &HookedTransformerConfig,
    src: &mut Source,
    out: &mut Converted,
) -> Result<()> {
    let h = cfg.n_heads;

    let w_e = src.take("embeddings.word_embeddings.weight")?;
    out.put("pos_embed.W_pos", src.take("embeddings.position_embeddings.weight")?);
    out.put(
        "token_type_embed.W_token_type",
        src.take("embeddings.token_type_embeddings.weight")?,
    );
    layer_norm(src, out, "embeddings.LayerNorm", "embed_ln")?;

    for l in 0..cfg.n_layers {
        let p = format!("encoder.layer.{l}");
        let b = format!("blocks.{l}");

        for (proj, name) in [("query", "Q"), ("key", "K"), ("value", "V")] {
            let w = src.take(&format!("{p}.attention.self.{proj}.weight"))?;
            out.put_in_heads(format!("{b}.attn.W_{name}"), &w, h)?;
            let bias = src.take(&format!("{p}.attention.self.{proj}.bias"))?;
            out.put_head_bias(format!("{b}.attn.b_{name}"), Some(bias), h)?;
        }
        out.put_out_heads(
            format!("{b}.attn.W_O"),
            &src.take(&format!("{p}.attention.output.dense.weight"))?,
        )?;
        out.put(
            format!("{b}.attn.b_O"),
            src.take(&format!("{p}.attention.output.dense.bias"))?,
        );
        layer_norm(src, out, &format!("{p}.attention.output.LayerNorm"), &format!("{b}.ln1"))?;

        out.put_t(format!("{b}.mlp.W_in"), &src.take(&format!("{p}.intermediate.dense.weight"))?)?;
        out.put(format!("{b}.mlp.b_in"), src.take(&format!("{p}.intermediate.dense.bias"))?);
        out.put_t(format!("{b}.mlp.W_out"), &src.take(&format!("{p}.output.dense.weight"))?)?;
        out.put(format!("{b}.mlp.b_out"), src.take(&format!("{p}.output.dense.bias"))?);
        layer_norm(src, out, &format!("{p}.output.LayerNorm"), &format!("{b}.ln2"))?;
    }

    out.put_t("mlm_head.W", &src.take("cls.predictions.transform.dense.weight")?)?;
    out.put("mlm_head.b", src.take("cls.predictions.transform.dense.bias")?);
    layer_norm(src, out, "cls.predictions.transform.LayerNorm", "mlm_head.ln")?;

    match src.take_opt("cls.predictions.decoder.weight")? {
        Some(decoder) => out.put_t("unembed.W_U", &decoder)?,
        None => out.put_t("unembed.W_U", &w_e)?,
    }
    let b_u = src.take_any(&["cls.predictions.bias", "cls.predictions.decoder.bias"])?;
    out.put("unembed.b_U", b_u);
    out.put("embed.W_E", w_e);
    Ok(())
}
