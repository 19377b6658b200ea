// SPDX-License-Identifier: MIT OR Apache-2.0

//! Function-preserving weight rewrites for decoder-only models.
//!
//! - [`fold_layer_norm`]: move norm weights and biases into the next
//!   linear map (`LN` → `LNPre`, `RMS` → `RMSPre`).
//! - [`center_writing_weights`]: remove the residual-direction mean of
//!   everything that writes to the residual stream.
//! - [`center_unembed`]: remove the vocabulary mean of the unembedding
//!   (log-probabilities are unchanged).
//! - [`fold_value_biases`]: move `b_V` into `b_O` (attention rows sum to 1).

use candle_core::{D, Tensor};
use tracing::{debug, warn};

use super::PretrainedOptions;
use super::state_dict::StateDict;
use crate::config::{Architecture, HookedTransformerConfig, PositionalEmbeddingType};
use crate::error::{LensError, Result};

/// Apply the rewrites selected in `opts`, in the canonical order.
///
/// Encoder and encoder-decoder configurations are left unchanged.
///
/// # Errors
///
/// Returns [`LensError::MissingWeight`] if the state dict lacks a parameter
/// a rewrite needs, and [`LensError::Model`] on tensor failures.
pub fn process_weights(
    state_dict: &mut StateDict,
    cfg: &mut HookedTransformerConfig,
    opts: &PretrainedOptions,
) -> Result<()> {
    if matches!(
        cfg.original_architecture,
        Some(Architecture::Bert | Architecture::T5)
    ) {
        if opts.any_processing() {
            warn!("weight processing only applies to decoder-only models; skipped");
        }
        return Ok(());
    }
    if opts.fold_ln {
        fold_layer_norm(state_dict, cfg)?;
    }
    if opts.center_writing_weights {
        center_writing_weights(state_dict, cfg)?;
    }
    if opts.center_unembed {
        center_unembed(state_dict)?;
    }
    if opts.fold_value_biases {
        fold_value_biases(state_dict, cfg)?;
    }
    Ok(())
}

/// Fold every norm's weight (and bias) into the linear maps reading from it.
///
/// For LayerNorm the folded weights are also centered along the residual
/// axis, since their input has zero mean.  Updates
/// `cfg.normalization_type` to the parameter-free variant.
///
/// # Errors
///
/// Returns [`LensError::MissingWeight`] for absent parameters.
pub fn fold_layer_norm(state_dict: &mut StateDict, cfg: &mut HookedTransformerConfig) -> Result<()> {
    let kind = cfg.normalization_type;
    if !kind.has_weight() {
        debug!(normalization = %kind, "fold_layer_norm: nothing to fold");
        return Ok(());
    }
    let center = kind.centers();
    for l in 0..cfg.n_layers {
        let attn = format!("blocks.{l}.attn");
        let targets: Vec<(String, Option<String>)> = ["Q", "K", "V"]
            .iter()
            .map(|n| (format!("{attn}.W_{n}"), Some(format!("{attn}.b_{n}"))))
            .collect();
        fold_norm(state_dict, &format!("blocks.{l}.ln1"), &targets, 1, center)?;

        if !cfg.attn_only {
            let mlp = format!("blocks.{l}.mlp");
            let mut targets = vec![(format!("{mlp}.W_in"), Some(format!("{mlp}.b_in")))];
            if cfg.gated_mlp {
                targets.push((format!("{mlp}.W_gate"), None));
            }
            fold_norm(state_dict, &format!("blocks.{l}.ln2"), &targets, 0, center)?;
        }
    }
    let targets = [("unembed.W_U".to_owned(), Some("unembed.b_U".to_owned()))];
    fold_norm(state_dict, "ln_final", &targets, 0, center)?;

    cfg.normalization_type = kind.folded();
    debug!(from = %kind, to = %cfg.normalization_type, "folded layer norms");
    Ok(())
}

/// Fold `{norm}.w` / `{norm}.b` into `targets`, whose residual axis is `axis`.
fn fold_norm(
    state_dict: &mut StateDict,
    norm: &str,
    targets: &[(String, Option<String>)],
    axis: usize,
    center: bool,
) -> Result<()> {
    let scale = state_dict.remove(&format!("{norm}.w"));
    let shift = state_dict.remove(&format!("{norm}.b"));
    for (w_name, b_name) in targets {
        let weight = param(state_dict, w_name)?;
        let mut shape = vec![1; weight.rank()];
        shape[axis] = weight.dim(axis)?;

        if let (Some(shift), Some(b_name)) = (&shift, b_name) {
            let extra = weight.broadcast_mul(&shift.reshape(shape.as_slice())?)?.sum(axis)?;
            let bias = (param(state_dict, b_name)? + extra)?;
            state_dict.insert(b_name.clone(), bias);
        }
        let mut weight = match &scale {
            Some(scale) => weight.broadcast_mul(&scale.reshape(shape.as_slice())?)?,
            None => weight,
        };
        if center {
            weight = weight.broadcast_sub(&weight.mean_keepdim(axis)?)?;
        }
        state_dict.insert(w_name.clone(), weight);
    }
    Ok(())
}

/// Remove the residual-direction mean from `W_E`, `W_pos`, `W_O`, `b_O`,
/// `W_out` and `b_out`.
///
/// Only valid when every reader of the residual stream centers its input;
/// for RMS models the call logs a warning and does nothing.
///
/// # Errors
///
/// Returns [`LensError::MissingWeight`] for absent parameters.
pub fn center_writing_weights(
    state_dict: &mut StateDict,
    cfg: &HookedTransformerConfig,
) -> Result<()> {
    if !cfg.normalization_type.centers() {
        warn!(
            normalization = %cfg.normalization_type,
            "center_writing_weights needs a centering norm; skipped"
        );
        return Ok(());
    }
    let mut names = vec!["embed.W_E".to_owned()];
    if cfg.positional_embedding_type == PositionalEmbeddingType::Standard {
        names.push("pos_embed.W_pos".to_owned());
    }
    for l in 0..cfg.n_layers {
        names.push(format!("blocks.{l}.attn.W_O"));
        names.push(format!("blocks.{l}.attn.b_O"));
        if !cfg.attn_only {
            names.push(format!("blocks.{l}.mlp.W_out"));
            names.push(format!("blocks.{l}.mlp.b_out"));
        }
    }
    for name in names {
        let t = param(state_dict, &name)?;
        let centered = t.broadcast_sub(&t.mean_keepdim(D::Minus1)?)?;
        state_dict.insert(name, centered);
    }
    debug!("centered writing weights");
    Ok(())
}

/// Remove the vocabulary mean from `W_U` and `b_U`.
///
/// # Errors
///
/// Returns [`LensError::MissingWeight`] for absent parameters.
pub fn center_unembed(state_dict: &mut StateDict) -> Result<()> {
    for name in ["unembed.W_U", "unembed.b_U"] {
        let t = param(state_dict, name)?;
        let centered = t.broadcast_sub(&t.mean_keepdim(D::Minus1)?)?;
        state_dict.insert(name.to_owned(), centered);
    }
    debug!("centered unembedding");
    Ok(())
}

/// Replace `b_V` by its contribution to `b_O`: `b_O += Σ_h b_V[h] W_O[h]`.
///
/// Key/value heads shared by several query heads contribute once per
/// query head.
///
/// # Errors
///
/// Returns [`LensError::MissingWeight`] for absent parameters.
pub fn fold_value_biases(state_dict: &mut StateDict, cfg: &HookedTransformerConfig) -> Result<()> {
    let repeats = cfg.kv_repeats();
    for l in 0..cfg.n_layers {
        let attn = format!("blocks.{l}.attn");
        let b_v = param(state_dict, &format!("{attn}.b_V"))?;
        let w_o = param(state_dict, &format!("{attn}.W_O"))?;
        let (kv, d) = b_v.dims2()?;
        let per_query = b_v
            .unsqueeze(1)?
            .broadcast_as((kv, repeats, d))?
            .reshape((kv * repeats, d))?;
        let folded = w_o.broadcast_mul(&per_query.unsqueeze(2)?)?.sum((0, 1))?;
        let b_o = (param(state_dict, &format!("{attn}.b_O"))? + folded)?;
        state_dict.insert(format!("{attn}.b_O"), b_o);
        state_dict.insert(format!("{attn}.b_V"), b_v.zeros_like()?);
    }
    debug!("folded value biases");
    Ok(())
}

fn param(state_dict: &StateDict, name: &str) -> Result<Tensor> {
    state_dict
        .get(name)
        .cloned()
        .ok_or_else(|| LensError::MissingWeight(name.to_owned()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::NormalizationType;
    use crate::loading::random_state_dict;
    use candle_core::Device;

    fn tiny() -> HookedTransformerConfig {
        HookedTransformerConfig::new(1, 8, 8, 4, 2, 7)
    }

    fn max_abs(t: &Tensor) -> f32 {
        t.abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn folding_removes_norm_parameters() {
        let mut cfg = tiny();
        let mut sd = random_state_dict(&cfg, &Device::Cpu).unwrap();
        fold_layer_norm(&mut sd, &mut cfg).unwrap();
        assert_eq!(cfg.normalization_type, NormalizationType::LayerNormPre);
        assert!(!sd.keys().any(|k| k.contains("ln")));
        // Centered along the residual axis.
        let w_q = &sd["blocks.0.attn.W_Q"];
        assert!(max_abs(&w_q.mean(1).unwrap()) < 1e-6);
        crate::loading::validate_state_dict(&cfg, &sd).unwrap();
    }

    #[test]
    fn norm_bias_moves_into_projection_bias() {
        let mut cfg = tiny();
        let mut sd = random_state_dict(&cfg, &Device::Cpu).unwrap();
        sd.insert(
            "ln_final.b".into(),
            Tensor::ones(8, candle_core::DType::F32, &Device::Cpu).unwrap(),
        );
        let w_u = sd["unembed.W_U"].clone();
        fold_layer_norm(&mut sd, &mut cfg).unwrap();
        let expected = w_u.sum(0).unwrap();
        assert!(max_abs(&(&sd["unembed.b_U"] - expected).unwrap()) < 1e-5);
    }

    #[test]
    fn centering_unembed_zeroes_vocab_mean() {
        let cfg = tiny();
        let mut sd = random_state_dict(&cfg, &Device::Cpu).unwrap();
        center_unembed(&mut sd).unwrap();
        assert!(max_abs(&sd["unembed.W_U"].mean(1).unwrap()) < 1e-6);
    }

    #[test]
    fn rms_models_skip_writing_weight_centering() {
        let cfg = HookedTransformerConfig {
            normalization_type: NormalizationType::RmsNorm,
            ..tiny()
        };
        let mut sd = random_state_dict(&cfg, &Device::Cpu).unwrap();
        let before = sd["embed.W_E"].clone();
        center_writing_weights(&mut sd, &cfg).unwrap();
        assert!(max_abs(&(&sd["embed.W_E"] - before).unwrap()) == 0.0);
    }

    #[test]
    fn value_bias_folding_with_shared_heads() {
        let cfg = HookedTransformerConfig {
            n_key_value_heads: 1,
            ..tiny()
        };
        let mut sd = random_state_dict(&cfg, &Device::Cpu).unwrap();
        let b_v = Tensor::ones((1, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        sd.insert("blocks.0.attn.b_V".into(), b_v);
        let w_o = sd["blocks.0.attn.W_O"].clone();
        fold_value_biases(&mut sd, &cfg).unwrap();
        // Both query heads read the single value head.
        let expected = w_o.sum((0, 1)).unwrap();
        assert!(max_abs(&(&sd["blocks.0.attn.b_O"] - expected).unwrap()) < 1e-5);
        assert!(max_abs(&sd["blocks.0.attn.b_V"]) == 0.0);
    }

    #[test]
    fn encoder_models_are_untouched() {
        let mut cfg = HookedTransformerConfig {
            original_architecture: Some(Architecture::Bert),
            ..tiny()
        };
        let mut sd = StateDict::new();
        process_weights(&mut sd, &mut cfg, &PretrainedOptions::default()).unwrap();
        assert_eq!(cfg.normalization_type, NormalizationType::LayerNorm);
    }
}
