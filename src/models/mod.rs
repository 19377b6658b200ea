// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hooked models.
//!
//! - [`HookedTransformer`]: decoder-only language models (GPT-2, NeoX,
//!   LLaMA family).
//! - [`HookedEncoder`]: BERT-style masked-LM encoders.
//! - [`HookedEncoderDecoder`]: T5-style sequence-to-sequence models.
//!
//! All three implement [`HookedRootModule`](crate::HookedRootModule) and
//! [`HookedWeights`].

mod encoder;
mod encoder_decoder;
mod transformer;
mod weights;

pub use encoder::{EncoderInput, HookedEncoder};
pub use encoder_decoder::{HookedEncoderDecoder, Seq2SeqInput};
pub use transformer::HookedTransformer;
pub use weights::HookedWeights;

use std::path::PathBuf;

use candle_core::Tensor;
use tracing::info;

use crate::config::HookedTransformerConfig;
use crate::error::{LensError, Result};
use crate::loading::{
    PretrainedOptions, StateDict, convert_state_dict, load_safetensors, process_weights,
    resolve_checkpoint, validate_state_dict,
};

// ---------------------------------------------------------------------------
// Forward options and outputs
// ---------------------------------------------------------------------------

/// What [`HookedTransformer::forward`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnType {
    /// Logits `[batch, pos, d_vocab_out]`.
    #[default]
    Logits,
    /// Mean next-token loss (scalar).
    Loss,
    /// Next-token loss per position `[batch, pos - 1]`.
    PerTokenLoss,
    /// Logits and mean loss.
    Both,
    /// Run for side effects (hooks) only.
    None,
}

/// Per-call settings of a decoder-only forward pass.
#[derive(Debug, Clone, Default)]
pub struct ForwardOptions {
    /// `[batch, pos]`, `1` for real tokens and `0` for padding.
    pub attention_mask: Option<Tensor>,
    /// Stop before block `n` and return the residual stream
    /// `[batch, pos, d_model]` instead of logits.
    pub stop_at_layer: Option<usize>,
}

impl ForwardOptions {
    /// Use `mask` as the padding mask.
    #[must_use]
    pub fn with_attention_mask(mut self, mask: Tensor) -> Self {
        self.attention_mask = Some(mask);
        self
    }

    /// Stop before block `layer`.
    #[must_use]
    pub const fn with_stop_at_layer(mut self, layer: usize) -> Self {
        self.stop_at_layer = Some(layer);
        self
    }
}

/// Result of [`HookedTransformer::forward`].
#[derive(Debug, Clone, Default)]
pub struct ForwardOutput {
    /// Logits, when requested.
    pub logits: Option<Tensor>,
    /// Loss (mean or per token), when requested.
    pub loss: Option<Tensor>,
}

impl ForwardOutput {
    /// The logits.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if logits were not requested.
    pub fn logits(&self) -> Result<&Tensor> {
        self.logits
            .as_ref()
            .ok_or_else(|| LensError::Config("logits were not requested".into()))
    }

    /// The loss.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if no loss was requested.
    pub fn loss(&self) -> Result<&Tensor> {
        self.loss
            .as_ref()
            .ok_or_else(|| LensError::Config("loss was not requested".into()))
    }
}

// ---------------------------------------------------------------------------
// Pretrained pipeline
// ---------------------------------------------------------------------------

/// A checkpoint turned into a validated, processed state dict.
pub(crate) struct Pretrained {
    pub cfg: HookedTransformerConfig,
    pub state_dict: StateDict,
    pub tokenizer: Option<PathBuf>,
}

/// Resolve, read, convert, validate and process a checkpoint.
///
/// Conversion and processing run on the CPU in `F32`; the model
/// constructor moves the parameters to `opts.device` in `opts.dtype`.
pub(crate) fn load_pretrained(
    name_or_path: &str,
    opts: &PretrainedOptions,
    accept: fn(&HookedTransformerConfig) -> bool,
    expected: &str,
) -> Result<Pretrained> {
    opts.check()?;
    let files = resolve_checkpoint(name_or_path, &opts.revision)?;
    let mut cfg = HookedTransformerConfig::from_hf_config(&files.read_config()?)?;
    if !accept(&cfg) {
        let arch = cfg
            .original_architecture
            .map_or_else(|| "unknown".to_owned(), |a| a.to_string());
        return Err(LensError::Config(format!(
            "{} is a {arch} checkpoint; load it with {expected}",
            files.name
        )));
    }
    cfg.dtype = opts.dtype;
    cfg.device = opts.device;
    cfg.tokenizer_name = Some(files.name.clone());

    let raw = load_safetensors(&files.weights, &candle_core::Device::Cpu)?;
    let mut state_dict = convert_state_dict(&cfg, raw)?;
    validate_state_dict(&cfg, &state_dict)?;
    process_weights(&mut state_dict, &mut cfg, opts)?;
    info!(
        model = %files.name,
        layers = cfg.n_layers,
        d_model = cfg.d_model,
        normalization = %cfg.normalization_type,
        "checkpoint loaded"
    );
    Ok(Pretrained {
        cfg,
        state_dict,
        tokenizer: files.tokenizer,
    })
}
