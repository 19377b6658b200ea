// SPDX-License-Identifier: MIT OR Apache-2.0

//! Head ablation: zero each attention head of GPT-2 in turn and report
//! how much the loss on a repeated sequence rises.  Induction heads stand
//! out on the second half of the sequence.
//!
//! ```bash
//! cargo run --release --example head_ablation
//! ```

use candle_core::{D, Tensor};
use candle_lens::util::loss::{mean_loss, per_token_loss};
use candle_lens::{
    HookPoint, HookedRootModule, HookedTransformer, HookedWeights, Intervention,
    PretrainedOptions, ReturnType, SamplingOptions,
};

fn main() -> candle_lens::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let model = HookedTransformer::from_pretrained("gpt2", &PretrainedOptions::default())?;
    let n_heads = model.cfg().n_heads;

    // A random half repeated once: [bos, x, x]
    let half = 20;
    let random = Tensor::rand(0f32, 1.0, half, model.device())?;
    let vocab = f64::from(u32::try_from(model.cfg().d_vocab).unwrap_or(u32::MAX));
    let ids = (random * (vocab - 1.0))?.floor()?.to_dtype(candle_core::DType::U32)?;
    let bos_id = model.tokenizer().and_then(|t| t.bos_token_id()).unwrap_or(0);
    let bos = Tensor::new(&[bos_id], model.device())?;
    let tokens = Tensor::cat(&[&bos, &ids, &ids], 0)?.unsqueeze(0)?;

    let second_half_loss = |logits: &Tensor| -> candle_lens::Result<f32> {
        let per_token = per_token_loss(logits, &tokens)?; // [1, pos - 1]
        let tail = per_token.narrow(D::Minus1, half, half)?;
        Ok(mean_loss(&tail, None)?.to_scalar::<f32>()?)
    };

    let clean = model.forward(&tokens, ReturnType::Logits)?;
    let baseline = second_half_loss(clean.logits()?)?;
    println!("clean loss on the repeat: {baseline:.3}");

    let labels = model.all_head_labels()?;
    let mut deltas = Vec::with_capacity(labels.len());
    for layer in 0..model.cfg().n_layers {
        for head in 0..n_heads {
            let logits = model.run_with_hooks(
                &tokens,
                vec![(
                    HookPoint::z(layer).into(),
                    candle_lens::Hook::Intervene(Intervention::ZeroHeads(vec![head])),
                )],
            )?;
            deltas.push(second_half_loss(&logits)? - baseline);
        }
    }

    let mut ranked: Vec<(&String, f32)> = labels.iter().zip(deltas).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    println!("\nHeads whose ablation hurts the repeat most:");
    for (label, delta) in ranked.iter().take(8) {
        println!("  {label:>6}: +{delta:.3}");
    }

    // Greedy continuation of the clean prompt, for reference.
    let prompt = model.to_tokens("Mr and Mrs Dursley, of number four, Privet Drive,", None)?;
    let text = model.generate(&prompt, 12, &SamplingOptions::greedy(), None)?;
    let ids: Vec<u32> = text.get(0)?.to_vec1()?;
    println!("\n{}", model.to_string(&ids)?);
    Ok(())
}
