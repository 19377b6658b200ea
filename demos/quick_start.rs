// SPDX-License-Identifier: MIT OR Apache-2.0

//! Quick start: load GPT-2, print the top next-token predictions and the
//! shape of a cached attention pattern.
//!
//! ```bash
//! cargo run --release --example quick_start
//! ```
//!
//! On first run, downloads GPT-2 small (~550 MB) from `HuggingFace` Hub.
//! Subsequent runs use the local cache.

use candle_lens::{
    HookPoint, HookedRootModule, HookedTransformer, PretrainedOptions, ReturnType,
};

fn main() -> candle_lens::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // 1. Load with the default weight processing (folded LN, centered weights)
    let model = HookedTransformer::from_pretrained("gpt2-small", &PretrainedOptions::default())?;
    let cfg = model.cfg();
    println!(
        "gpt2: {} layers, d_model {}, {} heads, normalization {}",
        cfg.n_layers, cfg.d_model, cfg.n_heads, cfg.normalization_type
    );

    // 2. Tokenize and run
    let prompt = "The Eiffel Tower is located in the city of";
    let tokens = model.to_tokens(prompt, None)?; // [1, pos]
    let out = model.forward(&tokens, ReturnType::Both)?;
    println!("\nPrompt: \"{prompt}\"");
    println!("Mean loss: {:.3}", out.loss()?.to_scalar::<f32>()?);

    let logits = out.logits()?;
    let last = logits.get(0)?.get(tokens.dim(1)? - 1)?; // [d_vocab]
    print_top_k(&model, &last, 5)?;

    // 3. Cache every attention pattern
    let (_, cache) = model.run_with_cache(&tokens, "blocks.*.attn.hook_pattern")?;
    let pattern = cache.require(&HookPoint::pattern(0))?;
    println!(
        "\nCached {} patterns; layer 0: {:?} [batch, head, query, key]",
        cache.len(),
        pattern.dims()
    );
    Ok(())
}

fn print_top_k(
    model: &HookedTransformer,
    logits: &candle_core::Tensor,
    k: usize,
) -> candle_lens::Result<()> {
    let scores: Vec<f32> = logits.to_vec1()?;
    let mut indexed: Vec<(usize, f32)> = scores.into_iter().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));

    println!("\nTop-{k} predictions:");
    for (rank, (idx, score)) in indexed.iter().take(k).enumerate() {
        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        let text = model.to_string(&[*idx as u32])?;
        println!("  #{}: {score:>8.3}  {text:?}", rank + 1);
    }
    Ok(())
}
