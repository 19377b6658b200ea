// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: every weight-processing step leaves the model
//! function unchanged (logits, or log-probs once the unembedding is
//! centered).
//!
//! Run:
//!   `cargo test --test weight_processing`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    missing_docs
)]

use candle_core::{D, Device, Tensor};
use candle_lens::loading::{StateDict, process_weights, random_state_dict};
use candle_lens::{
    ActivationFunction, HookedTransformer, HookedTransformerConfig, NormalizationType,
    PositionalEmbeddingType, PretrainedOptions, ReturnType,
};

const TOLERANCE: f32 = 1e-4;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn gpt2_like() -> HookedTransformerConfig {
    HookedTransformerConfig::new(2, 16, 12, 4, 4, 23)
}

fn llama_like() -> HookedTransformerConfig {
    let mut cfg = HookedTransformerConfig::new(2, 16, 12, 4, 4, 23);
    cfg.n_key_value_heads = 2;
    cfg.normalization_type = NormalizationType::RmsNorm;
    cfg.positional_embedding_type = PositionalEmbeddingType::Rotary;
    cfg.gated_mlp = true;
    cfg.act_fn = ActivationFunction::Silu;
    cfg.d_mlp = 24;
    cfg
}

fn neox_like() -> HookedTransformerConfig {
    let mut cfg = HookedTransformerConfig::new(2, 16, 12, 4, 4, 23);
    cfg.positional_embedding_type = PositionalEmbeddingType::Rotary;
    cfg.rotary_dim = 2;
    cfg.parallel_attn_mlp = true;
    cfg.act_fn = ActivationFunction::Gelu;
    cfg
}

/// Random state dict with non-trivial norm weights and biases, so every
/// fold actually moves something.
fn perturbed(cfg: &HookedTransformerConfig) -> StateDict {
    let mut sd = random_state_dict(cfg, &Device::Cpu).unwrap();
    for (name, tensor) in &mut sd {
        let leaf = name.rsplit('.').next().unwrap();
        let dims = tensor.dims().to_vec();
        if leaf == "w" {
            let noise = Tensor::randn(0f32, 0.3, dims, &Device::Cpu).unwrap();
            *tensor = (noise + 1.0).unwrap();
        } else if leaf.starts_with('b') {
            *tensor = Tensor::randn(0f32, 0.2, dims, &Device::Cpu).unwrap();
        }
    }
    sd
}

fn tokens() -> Tensor {
    Tensor::new(&[[3_u32, 7, 1, 19, 4, 4], [0, 2, 22, 9, 11, 5]], &Device::Cpu).unwrap()
}

fn logits(model: &HookedTransformer) -> Tensor {
    model
        .forward(&tokens(), ReturnType::Logits)
        .unwrap()
        .logits()
        .unwrap()
        .clone()
}

fn log_probs(model: &HookedTransformer) -> Tensor {
    candle_nn::ops::log_softmax(&logits(model), D::Minus1).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

/// Build the model before and after processing `cfg`'s random weights.
fn before_after(
    cfg: HookedTransformerConfig,
    opts: &PretrainedOptions,
) -> (HookedTransformer, HookedTransformer) {
    let sd = perturbed(&cfg);
    let before = HookedTransformer::from_state_dict(cfg.clone(), sd.clone()).unwrap();
    let (mut cfg, mut sd) = (cfg, sd);
    process_weights(&mut sd, &mut cfg, opts).unwrap();
    let after = HookedTransformer::from_state_dict(cfg, sd).unwrap();
    (before, after)
}

// ---------------------------------------------------------------------------
// Individual steps
// ---------------------------------------------------------------------------

#[test]
fn fold_ln_preserves_logits() {
    for cfg in [gpt2_like(), llama_like(), neox_like()] {
        let opts = PretrainedOptions::no_processing().with_fold_ln(true);
        let (before, after) = before_after(cfg, &opts);
        assert!(!after.cfg().normalization_type.has_weight());
        let diff = max_abs_diff(&logits(&before), &logits(&after));
        assert!(diff < TOLERANCE, "fold_ln moved logits by {diff}");
    }
}

#[test]
fn fold_ln_switches_to_parameter_free_norms() {
    let opts = PretrainedOptions::no_processing().with_fold_ln(true);
    let (_, ln) = before_after(gpt2_like(), &opts);
    assert_eq!(ln.cfg().normalization_type, NormalizationType::LayerNormPre);
    let (_, rms) = before_after(llama_like(), &opts);
    assert_eq!(rms.cfg().normalization_type, NormalizationType::RmsNormPre);
}

#[test]
fn centering_writing_weights_preserves_logits() {
    let opts = PretrainedOptions::no_processing().with_center_writing_weights(true);
    let (before, after) = before_after(gpt2_like(), &opts);
    let diff = max_abs_diff(&logits(&before), &logits(&after));
    assert!(diff < TOLERANCE, "center_writing_weights moved logits by {diff}");
}

#[test]
fn centering_unembed_preserves_log_probs() {
    let opts = PretrainedOptions::no_processing().with_center_unembed(true);
    let (before, after) = before_after(gpt2_like(), &opts);
    let diff = max_abs_diff(&log_probs(&before), &log_probs(&after));
    assert!(diff < TOLERANCE, "center_unembed moved log-probs by {diff}");
}

#[test]
fn folding_value_biases_preserves_logits() {
    for cfg in [gpt2_like(), llama_like()] {
        let opts = PretrainedOptions::no_processing().with_fold_value_biases(true);
        let (before, after) = before_after(cfg, &opts);
        let diff = max_abs_diff(&logits(&before), &logits(&after));
        assert!(diff < TOLERANCE, "fold_value_biases moved logits by {diff}");
    }
}

// ---------------------------------------------------------------------------
// Full pipeline
// ---------------------------------------------------------------------------

#[test]
fn default_processing_preserves_log_probs() {
    for cfg in [gpt2_like(), llama_like(), neox_like()] {
        let (before, after) = before_after(cfg, &PretrainedOptions::default());
        let diff = max_abs_diff(&log_probs(&before), &log_probs(&after));
        assert!(diff < TOLERANCE, "processing moved log-probs by {diff}");
    }
}

#[test]
fn processing_preserves_loss() {
    let (before, after) = before_after(gpt2_like(), &PretrainedOptions::default());
    let loss = |m: &HookedTransformer| {
        m.forward(&tokens(), ReturnType::Loss)
            .unwrap()
            .loss()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    };
    assert!((loss(&before) - loss(&after)).abs() < TOLERANCE);
}
