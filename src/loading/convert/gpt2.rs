// SPDX-License-Identifier: MIT OR Apache-2.0

//! `GPT2LMHeadModel` checkpoints.
//!
//! GPT-2 uses `Conv1D` layers stored `[in, out]`, and a fused `c_attn`
//! projection whose output columns are `[Q | K | V]`.

use super::{Converted, Source};
use crate::config::HookedTransformerConfig;
use crate::error::Result;

pub(super) fn convert(
    cfg: &HookedTransformerConfig,
    src: &mut Source,
    out: &mut Converted,
) -> Result<()> {
    let (m, h, d) = (cfg.d_model, cfg.n_heads, cfg.d_head);
    let hd = h * d;

    let w_e = src.take("wte.weight")?;
    out.put("unembed.W_U", w_e.t()?.contiguous()?);
    out.put("embed.W_E", w_e);
    out.put("pos_embed.W_pos", src.take("wpe.weight")?);
    out.zeros("unembed.b_U", &[cfg.d_vocab_out])?;

    for l in 0..cfg.n_layers {
        let p = format!("h.{l}");
        let b = format!("blocks.{l}");

        let w = src.take(&format!("{p}.ln_1.weight"))?;
        let bias = src.take(&format!("{p}.ln_1.bias"))?;
        out.put_norm(&format!("{b}.ln1"), w, Some(bias));

        let qkv = src.take(&format!("{p}.attn.c_attn.weight"))?; // [m, 3 * hd]
        let qkv_b = src.take(&format!("{p}.attn.c_attn.bias"))?; // [3 * hd]
        for (i, name) in ["Q", "K", "V"].into_iter().enumerate() {
            let w = qkv
                .narrow(1, i * hd, hd)?
                .reshape((m, h, d))?
                .permute((1, 0, 2))?
                .contiguous()?;
            out.put(format!("{b}.attn.W_{name}"), w);
            out.put(
                format!("{b}.attn.b_{name}"),
                qkv_b.narrow(0, i * hd, hd)?.reshape((h, d))?,
            );
        }
        // c_proj is [hd, m]; rows are (head, d_head).
        let w_o = src.take(&format!("{p}.attn.c_proj.weight"))?;
        out.put(format!("{b}.attn.W_O"), w_o.reshape((h, d, m))?);
        out.put(format!("{b}.attn.b_O"), src.take(&format!("{p}.attn.c_proj.bias"))?);

        let w = src.take(&format!("{p}.ln_2.weight"))?;
        let bias = src.take(&format!("{p}.ln_2.bias"))?;
        out.put_norm(&format!("{b}.ln2"), w, Some(bias));

        out.put(format!("{b}.mlp.W_in"), src.take(&format!("{p}.mlp.c_fc.weight"))?);
        out.put(format!("{b}.mlp.b_in"), src.take(&format!("{p}.mlp.c_fc.bias"))?);
        out.put(format!("{b}.mlp.W_out"), src.take(&format!("{p}.mlp.c_proj.weight"))?);
        out.put(format!("{b}.mlp.b_out"), src.take(&format!("{p}.mlp.c_proj.bias"))?);
    }

    let w = src.take("ln_f.weight")?;
    let bias = src.take("ln_f.bias")?;
    out.put_norm("ln_final", w, Some(bias));
    Ok(())
}
