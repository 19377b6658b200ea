// SPDX-License-Identifier: MIT OR Apache-2.0

//! Instrumented state dicts: expected shapes, validation, random init.

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Tensor};

use crate::config::{Architecture, HookedTransformerConfig, PositionalEmbeddingType};
use crate::error::{LensError, Result};

/// Map from instrumented parameter name to tensor.
pub type StateDict = HashMap<String, Tensor>;

/// Which stacks and heads a configuration implies.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Family {
    DecoderOnly,
    Encoder,
    EncoderDecoder,
}

impl Family {
    fn of(cfg: &HookedTransformerConfig) -> Self {
        match cfg.original_architecture {
            Some(Architecture::Bert) => Self::Encoder,
            Some(Architecture::T5) => Self::EncoderDecoder,
            _ => Self::DecoderOnly,
        }
    }
}

/// Every parameter the architecture described by `cfg` needs, with its
/// shape, sorted by name.
///
/// The family is taken from `cfg.original_architecture`: BERT gives an
/// encoder, T5 an encoder-decoder, anything else (including `None`) a
/// decoder-only model.
#[must_use]
pub fn expected_param_shapes(cfg: &HookedTransformerConfig) -> BTreeMap<String, Vec<usize>> {
    let mut shapes = BTreeMap::new();
    let (m, d, h, kv) = (cfg.d_model, cfg.d_head, cfg.n_heads, cfg.n_key_value_heads);
    let mut put = |name: String, shape: Vec<usize>| {
        shapes.insert(name, shape);
    };

    let norm = |put: &mut dyn FnMut(String, Vec<usize>), prefix: &str, with_bias: bool| {
        if cfg.normalization_type.has_weight() {
            put(format!("{prefix}.w"), vec![m]);
        }
        if with_bias && cfg.normalization_type.has_bias() {
            put(format!("{prefix}.b"), vec![m]);
        }
    };
    let attn = |put: &mut dyn FnMut(String, Vec<usize>), prefix: &str, kv_heads: usize| {
        put(format!("{prefix}.W_Q"), vec![h, m, d]);
        put(format!("{prefix}.W_K"), vec![kv_heads, m, d]);
        put(format!("{prefix}.W_V"), vec![kv_heads, m, d]);
        put(format!("{prefix}.b_Q"), vec![h, d]);
        put(format!("{prefix}.b_K"), vec![kv_heads, d]);
        put(format!("{prefix}.b_V"), vec![kv_heads, d]);
        put(format!("{prefix}.W_O"), vec![h, d, m]);
        put(format!("{prefix}.b_O"), vec![m]);
    };
    let mlp = |put: &mut dyn FnMut(String, Vec<usize>), prefix: &str| {
        put(format!("{prefix}.W_in"), vec![m, cfg.d_mlp]);
        if cfg.gated_mlp {
            put(format!("{prefix}.W_gate"), vec![m, cfg.d_mlp]);
        }
        put(format!("{prefix}.b_in"), vec![cfg.d_mlp]);
        put(format!("{prefix}.W_out"), vec![cfg.d_mlp, m]);
        put(format!("{prefix}.b_out"), vec![m]);
    };

    put("embed.W_E".into(), vec![cfg.d_vocab, m]);
    if cfg.positional_embedding_type == PositionalEmbeddingType::Standard {
        put("pos_embed.W_pos".into(), vec![cfg.n_ctx, m]);
    }
    put("unembed.W_U".into(), vec![m, cfg.d_vocab_out]);
    put("unembed.b_U".into(), vec![cfg.d_vocab_out]);

    match Family::of(cfg) {
        Family::DecoderOnly => {
            for l in 0..cfg.n_layers {
                norm(&mut put, &format!("blocks.{l}.ln1"), true);
                attn(&mut put, &format!("blocks.{l}.attn"), kv);
                if !cfg.attn_only {
                    norm(&mut put, &format!("blocks.{l}.ln2"), true);
                    mlp(&mut put, &format!("blocks.{l}.mlp"));
                }
            }
            norm(&mut put, "ln_final", true);
        }
        Family::Encoder => {
            // Post-norm blocks always carry a full LayerNorm.
            let ln = |put: &mut dyn FnMut(String, Vec<usize>), prefix: &str| {
                put(format!("{prefix}.w"), vec![m]);
                put(format!("{prefix}.b"), vec![m]);
            };
            put("token_type_embed.W_token_type".into(), vec![2, m]);
            ln(&mut put, "embed_ln");
            for l in 0..cfg.n_layers {
                attn(&mut put, &format!("blocks.{l}.attn"), kv);
                ln(&mut put, &format!("blocks.{l}.ln1"));
                mlp(&mut put, &format!("blocks.{l}.mlp"));
                ln(&mut put, &format!("blocks.{l}.ln2"));
            }
            put("mlm_head.W".into(), vec![m, m]);
            put("mlm_head.b".into(), vec![m]);
            ln(&mut put, "mlm_head.ln");
        }
        Family::EncoderDecoder => {
            for (stack, cross) in [("encoder", false), ("decoder", true)] {
                for l in 0..cfg.n_layers {
                    let block = format!("{stack}.{l}");
                    norm(&mut put, &format!("{block}.ln1"), true);
                    attn(&mut put, &format!("{block}.attn"), kv);
                    if l == 0 {
                        put(
                            format!("{block}.attn.rel_pos_bias"),
                            vec![cfg.relative_attention_num_buckets, h],
                        );
                    }
                    norm(&mut put, &format!("{block}.ln2"), true);
                    if cross {
                        attn(&mut put, &format!("{block}.cross_attn"), h);
                        norm(&mut put, &format!("{block}.ln3"), true);
                    }
                    mlp(&mut put, &format!("{block}.mlp"));
                }
                norm(&mut put, &format!("{stack}_final_ln"), true);
            }
        }
    }
    shapes
}

/// Check a converted state dict against the shapes `cfg` implies.
///
/// Extra entries are ignored.
///
/// # Errors
///
/// Returns [`LensError::MissingWeight`] for an absent parameter and
/// [`LensError::ShapeMismatch`] for a parameter of the wrong shape.
pub fn validate_state_dict(cfg: &HookedTransformerConfig, state_dict: &StateDict) -> Result<()> {
    for (name, expected) in expected_param_shapes(cfg) {
        let tensor = state_dict
            .get(&name)
            .ok_or_else(|| LensError::MissingWeight(name.clone()))?;
        if tensor.dims() != expected.as_slice() {
            return Err(LensError::ShapeMismatch {
                name,
                expected,
                found: tensor.dims().to_vec(),
            });
        }
    }
    Ok(())
}

/// Untrained parameters for `cfg`: weights `N(0, init_range)`, norm
/// weights one, biases zero.
///
/// # Errors
///
/// Returns [`LensError::Model`] if tensor creation fails.
pub fn random_state_dict(cfg: &HookedTransformerConfig, device: &Device) -> Result<StateDict> {
    let mut out = StateDict::new();
    for (name, shape) in expected_param_shapes(cfg) {
        let leaf = name.rsplit('.').next().unwrap_or(&name);
        let tensor = if leaf == "w" {
            Tensor::ones(shape, DType::F32, device)?
        } else if leaf.starts_with('b') {
            Tensor::zeros(shape, DType::F32, device)?
        } else {
            #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
            let std = cfg.init_range as f32;
            Tensor::randn(0f32, std, shape, device)?
        };
        out.insert(name, tensor);
    }
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::NormalizationType;

    fn tiny() -> HookedTransformerConfig {
        HookedTransformerConfig::new(2, 8, 16, 4, 2, 11)
    }

    #[test]
    fn decoder_only_shapes() {
        let shapes = expected_param_shapes(&tiny());
        assert_eq!(shapes["blocks.1.attn.W_Q"], vec![2, 8, 4]);
        assert_eq!(shapes["blocks.0.mlp.W_in"], vec![8, 32]);
        assert_eq!(shapes["unembed.W_U"], vec![8, 11]);
        assert!(shapes.contains_key("ln_final.b"));
        assert!(!shapes.contains_key("blocks.0.mlp.W_gate"));
    }

    #[test]
    fn folded_norms_have_no_parameters() {
        let cfg = HookedTransformerConfig {
            normalization_type: NormalizationType::LayerNormPre,
            ..tiny()
        };
        let shapes = expected_param_shapes(&cfg);
        assert!(!shapes.keys().any(|k| k.contains("ln")));
    }

    #[test]
    fn encoder_decoder_shapes() {
        let cfg = HookedTransformerConfig {
            original_architecture: Some(Architecture::T5),
            normalization_type: NormalizationType::RmsNorm,
            positional_embedding_type: PositionalEmbeddingType::Relative,
            ..tiny()
        };
        let shapes = expected_param_shapes(&cfg);
        assert_eq!(shapes["encoder.0.attn.rel_pos_bias"], vec![32, 2]);
        assert!(!shapes.contains_key("encoder.1.attn.rel_pos_bias"));
        assert!(shapes.contains_key("decoder.1.cross_attn.W_K"));
        assert!(shapes.contains_key("decoder.1.ln3.w"));
        assert!(!shapes.contains_key("encoder.1.ln3.w"));
        assert!(!shapes.contains_key("pos_embed.W_pos"));
    }

    #[test]
    fn random_dict_validates() {
        let cfg = tiny();
        let sd = random_state_dict(&cfg, &Device::Cpu).unwrap();
        validate_state_dict(&cfg, &sd).unwrap();
        assert_eq!(
            sd["blocks.0.ln1.w"].to_vec1::<f32>().unwrap(),
            vec![1.0; 8]
        );
        assert_eq!(sd["blocks.0.attn.b_O"].to_vec1::<f32>().unwrap(), vec![0.0; 8]);
    }

    #[test]
    fn validation_reports_shape_and_absence() {
        let cfg = tiny();
        let mut sd = random_state_dict(&cfg, &Device::Cpu).unwrap();
        sd.insert(
            "blocks.0.attn.W_Q".into(),
            Tensor::zeros((2, 4, 8), DType::F32, &Device::Cpu).unwrap(),
        );
        match validate_state_dict(&cfg, &sd).unwrap_err() {
            LensError::ShapeMismatch { name, expected, found } => {
                assert_eq!(name, "blocks.0.attn.W_Q");
                assert_eq!(expected, vec![2, 8, 4]);
                assert_eq!(found, vec![2, 4, 8]);
            }
            other => panic!("unexpected error {other}"),
        }
        sd.remove("blocks.0.attn.W_Q");
        assert!(matches!(
            validate_state_dict(&cfg, &sd),
            Err(LensError::MissingWeight(_))
        ));
    }
}
