// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: the pretrained loader on a tiny GPT-2 checkpoint
//! written to a temporary directory, plus the error paths that fail
//! before any download.
//!
//! Run:
//!   `cargo test --test loading`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    missing_docs
)]

use std::collections::HashMap;
use std::path::Path;

use candle_core::{D, Device, Tensor};
use candle_lens::{
    HookPoint, HookedEncoder, HookedRootModule, HookedTransformer, LensError,
    NormalizationType, PretrainedOptions, ReturnType,
};

const D_MODEL: usize = 8;
const N_HEADS: usize = 2;
const N_CTX: usize = 16;
const VOCAB: usize = 13;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn randn(shape: &[usize], std: f32) -> Tensor {
    Tensor::randn(0f32, std, shape, &Device::Cpu).unwrap()
}

/// Tensors named like a `GPT2LMHeadModel` checkpoint.
fn gpt2_tensors(n_layers: usize) -> HashMap<String, Tensor> {
    let m = D_MODEL;
    let mut t = HashMap::new();
    t.insert("transformer.wte.weight".to_owned(), randn(&[VOCAB, m], 0.2));
    t.insert("transformer.wpe.weight".to_owned(), randn(&[N_CTX, m], 0.2));
    for l in 0..n_layers {
        let p = format!("transformer.h.{l}");
        for ln in ["ln_1", "ln_2"] {
            t.insert(format!("{p}.{ln}.weight"), (randn(&[m], 0.1) + 1.0).unwrap());
            t.insert(format!("{p}.{ln}.bias"), randn(&[m], 0.1));
        }
        t.insert(format!("{p}.attn.c_attn.weight"), randn(&[m, 3 * m], 0.2));
        t.insert(format!("{p}.attn.c_attn.bias"), randn(&[3 * m], 0.1));
        t.insert(format!("{p}.attn.c_proj.weight"), randn(&[m, m], 0.2));
        t.insert(format!("{p}.attn.c_proj.bias"), randn(&[m], 0.1));
        t.insert(format!("{p}.mlp.c_fc.weight"), randn(&[m, 4 * m], 0.2));
        t.insert(format!("{p}.mlp.c_fc.bias"), randn(&[4 * m], 0.1));
        t.insert(format!("{p}.mlp.c_proj.weight"), randn(&[4 * m, m], 0.2));
        t.insert(format!("{p}.mlp.c_proj.bias"), randn(&[m], 0.1));
    }
    t.insert("transformer.ln_f.weight".to_owned(), (randn(&[m], 0.1) + 1.0).unwrap());
    t.insert("transformer.ln_f.bias".to_owned(), randn(&[m], 0.1));
    t
}

fn write_checkpoint(dir: &Path, n_layers: usize, tensors: &HashMap<String, Tensor>) {
    let config = serde_json::json!({
        "model_type": "gpt2",
        "n_embd": D_MODEL,
        "n_layer": n_layers,
        "n_head": N_HEADS,
        "n_positions": N_CTX,
        "vocab_size": VOCAB,
        "activation_function": "gelu_new",
        "layer_norm_epsilon": 1e-5
    });
    std::fs::write(dir.join("config.json"), config.to_string()).unwrap();
    candle_core::safetensors::save(tensors, dir.join("model.safetensors")).unwrap();
}

fn tiny_checkpoint() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_checkpoint(dir.path(), 2, &gpt2_tensors(2));
    dir
}

fn tokens() -> Tensor {
    Tensor::new(&[[0_u32, 4, 12, 7, 3]], &Device::Cpu).unwrap()
}

fn log_probs(model: &HookedTransformer) -> Tensor {
    let logits = model.forward(&tokens(), ReturnType::Logits).unwrap();
    candle_nn::ops::log_softmax(logits.logits().unwrap(), D::Minus1).unwrap()
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

// ---------------------------------------------------------------------------
// Local checkpoints
// ---------------------------------------------------------------------------

#[test]
fn local_checkpoint_loads_and_runs() {
    let dir = tiny_checkpoint();
    let path = dir.path().to_str().unwrap();
    let model = HookedTransformer::from_pretrained(path, &PretrainedOptions::default()).unwrap();
    assert_eq!(model.cfg().n_layers, 2);
    assert_eq!(model.cfg().normalization_type, NormalizationType::LayerNormPre);
    assert!(model.tokenizer().is_none());

    let (logits, cache) = model.run_with_cache(&tokens(), HookPoint::pattern(1)).unwrap();
    assert_eq!(logits.dims(), &[1, 5, VOCAB]);
    assert_eq!(cache.require(&HookPoint::pattern(1)).unwrap().dims(), &[1, N_HEADS, 5, 5]);
}

#[test]
fn processing_matches_unprocessed_checkpoint() {
    let dir = tiny_checkpoint();
    let path = dir.path().to_str().unwrap();
    let raw = HookedTransformer::from_pretrained(path, &PretrainedOptions::no_processing()).unwrap();
    let processed = HookedTransformer::from_pretrained(path, &PretrainedOptions::default()).unwrap();
    assert_eq!(raw.cfg().normalization_type, NormalizationType::LayerNorm);
    let diff = max_abs_diff(&log_probs(&raw), &log_probs(&processed));
    assert!(diff < 1e-4, "processing moved log-probs by {diff}");
}

#[test]
fn tied_unembedding_is_the_transposed_embedding() {
    let dir = tiny_checkpoint();
    let path = dir.path().to_str().unwrap();
    let model = HookedTransformer::from_pretrained(path, &PretrainedOptions::no_processing()).unwrap();
    let w_e_t = model.w_e().t().unwrap();
    assert!(max_abs_diff(model.w_u(), &w_e_t) < 1e-6);
}

#[test]
fn missing_tensor_is_reported_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let mut tensors = gpt2_tensors(2);
    tensors.remove("transformer.h.1.mlp.c_fc.bias");
    write_checkpoint(dir.path(), 2, &tensors);
    let err = HookedTransformer::from_pretrained(
        dir.path().to_str().unwrap(),
        &PretrainedOptions::default(),
    )
    .unwrap_err();
    match err {
        LensError::MissingWeight(name) => assert!(name.contains("h.1.mlp.c_fc.bias"), "{name}"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn misshapen_tensor_is_a_shape_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let mut tensors = gpt2_tensors(2);
    tensors.insert("transformer.wpe.weight".to_owned(), randn(&[N_CTX + 1, D_MODEL], 0.2));
    write_checkpoint(dir.path(), 2, &tensors);
    let err = HookedTransformer::from_pretrained(
        dir.path().to_str().unwrap(),
        &PretrainedOptions::default(),
    )
    .unwrap_err();
    match err {
        LensError::ShapeMismatch { name, expected, found } => {
            assert_eq!(name, "pos_embed.W_pos");
            assert_eq!(expected, vec![N_CTX, D_MODEL]);
            assert_eq!(found, vec![N_CTX + 1, D_MODEL]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn wrong_model_class_is_rejected() {
    let dir = tiny_checkpoint();
    let err = HookedEncoder::from_pretrained(
        dir.path().to_str().unwrap(),
        &PretrainedOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, LensError::Config(_)), "{err}");
}

#[test]
fn directory_without_weights_is_missing_weight() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.json"), r#"{"model_type": "gpt2"}"#).unwrap();
    let err = HookedTransformer::from_pretrained(
        dir.path().to_str().unwrap(),
        &PretrainedOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, LensError::MissingWeight(_)), "{err}");
}

// ---------------------------------------------------------------------------
// Errors before any download
// ---------------------------------------------------------------------------

#[test]
fn quantization_is_rejected() {
    let opts = PretrainedOptions::default().with_quantization("int8");
    let err = HookedTransformer::from_pretrained("gpt2", &opts).unwrap_err();
    assert!(matches!(err, LensError::UnsupportedQuantization(_)), "{err}");
}

#[test]
fn unknown_name_suggests_close_matches() {
    let err = HookedTransformer::from_pretrained("gpt2-smal", &PretrainedOptions::default())
        .unwrap_err();
    match err {
        LensError::UnknownCheckpoint { name, suggestions } => {
            assert_eq!(name, "gpt2-smal");
            assert!(suggestions.iter().any(|s| s == "gpt2"), "{suggestions:?}");
        }
        other => panic!("unexpected error: {other}"),
    }
}
