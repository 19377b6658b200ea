// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pretrained-weight loading.
//!
//! A checkpoint goes through four stages before it becomes a model:
//!
//! 1. [`resolve_checkpoint`]: a local directory, or an `hf-hub` download
//!    into the standard `HuggingFace` cache.
//! 2. [`convert_state_dict`]: per-family renaming and reshaping into the
//!    instrumented parameter names (`blocks.0.attn.W_Q`, ...).
//! 3. [`validate_state_dict`]: shape check against the configuration.
//! 4. [`process_weights`]: function-preserving rewrites (layer-norm
//!    folding, centering, value-bias folding) for decoder-only models.
//!
//! [`random_state_dict`] builds an untrained state dict with the same
//! names and shapes.

mod checkpoint;
mod convert;
mod processing;
mod state_dict;

pub use checkpoint::{CheckpointFiles, load_safetensors, resolve_checkpoint};
pub use convert::convert_state_dict;
pub use processing::{
    center_unembed, center_writing_weights, fold_layer_norm, fold_value_biases, process_weights,
};
pub use state_dict::{StateDict, expected_param_shapes, random_state_dict, validate_state_dict};

use crate::config::{DeviceSpec, Precision};
use crate::error::{LensError, Result};

// ---------------------------------------------------------------------------
// Official model names
// ---------------------------------------------------------------------------

/// Supported checkpoints and their short aliases.
const OFFICIAL_MODELS: &[(&str, &[&str])] = &[
    ("gpt2", &["gpt2-small"]),
    ("gpt2-medium", &[]),
    ("gpt2-large", &[]),
    ("gpt2-xl", &[]),
    ("distilgpt2", &["distil-gpt2", "distillgpt2", "distill-gpt2"]),
    ("EleutherAI/pythia-14m", &["pythia-14m"]),
    ("EleutherAI/pythia-70m", &["pythia-70m"]),
    ("EleutherAI/pythia-160m", &["pythia-160m"]),
    ("EleutherAI/pythia-410m", &["pythia-410m"]),
    ("EleutherAI/pythia-1b", &["pythia-1b"]),
    ("EleutherAI/pythia-1.4b", &["pythia-1.4b"]),
    ("meta-llama/Llama-2-7b-hf", &["llama-2-7b", "llama2-7b"]),
    ("meta-llama/Llama-3.2-1B", &["llama-3.2-1b"]),
    ("mistralai/Mistral-7B-v0.1", &["mistral-7b"]),
    ("Qwen/Qwen2-0.5B", &["qwen2-0.5b"]),
    ("Qwen/Qwen2.5-0.5B", &["qwen2.5-0.5b"]),
    ("bert-base-cased", &[]),
    ("bert-base-uncased", &[]),
    ("t5-small", &[]),
    ("t5-base", &[]),
    ("t5-large", &[]),
];

/// Every official checkpoint name, in table order.
#[must_use]
pub fn official_model_names() -> Vec<&'static str> {
    OFFICIAL_MODELS.iter().map(|(name, _)| *name).collect()
}

/// Resolve a checkpoint name or alias to its official repository name.
///
/// Matching is case-insensitive.
///
/// ```
/// use candle_lens::loading::get_official_model_name;
///
/// assert_eq!(get_official_model_name("gpt2-small").unwrap(), "gpt2");
/// assert_eq!(get_official_model_name("Pythia-70M").unwrap(), "EleutherAI/pythia-70m");
/// ```
///
/// # Errors
///
/// Returns [`LensError::UnknownCheckpoint`] with the closest official names.
pub fn get_official_model_name(name: &str) -> Result<&'static str> {
    let wanted = name.to_lowercase();
    for (official, aliases) in OFFICIAL_MODELS {
        if official.to_lowercase() == wanted || aliases.iter().any(|a| *a == wanted) {
            return Ok(official);
        }
    }
    Err(LensError::UnknownCheckpoint {
        name: name.to_owned(),
        suggestions: suggestions(&wanted),
    })
}

/// Official names within a small edit distance of `wanted`, or containing it.
fn suggestions(wanted: &str) -> Vec<String> {
    let mut scored: Vec<(usize, &str)> = OFFICIAL_MODELS
        .iter()
        .flat_map(|(official, aliases)| {
            std::iter::once(*official)
                .chain(aliases.iter().copied())
                .map(move |candidate| (candidate, *official))
        })
        .filter_map(|(candidate, official)| {
            let candidate = candidate.to_lowercase();
            let short = candidate.rsplit('/').next().unwrap_or(&candidate);
            let distance = edit_distance(wanted, short).min(edit_distance(wanted, &candidate));
            (distance <= 3 || (wanted.len() >= 3 && candidate.contains(wanted)))
                .then_some((distance, official))
        })
        .collect();
    scored.sort_unstable();
    let mut out: Vec<String> = Vec::new();
    for (_, official) in scored {
        if !out.iter().any(|o| o == official) {
            out.push(official.to_owned());
        }
        if out.len() == 5 {
            break;
        }
    }
    out
}

/// Levenshtein distance over chars.
fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut row = Vec::with_capacity(b.len() + 1);
        row.push(i + 1);
        for (j, cb) in b.iter().enumerate() {
            let substitute = prev[j] + usize::from(ca != *cb);
            row.push(substitute.min(prev[j + 1] + 1).min(row[j] + 1));
        }
        prev = row;
    }
    prev[b.len()]
}

// ---------------------------------------------------------------------------
// PretrainedOptions
// ---------------------------------------------------------------------------

/// Options for `from_pretrained`.
///
/// The weight-processing flags default to on and only affect decoder-only
/// models.
///
/// ```
/// use candle_lens::loading::PretrainedOptions;
/// use candle_lens::Precision;
///
/// let opts = PretrainedOptions::default()
///     .with_fold_ln(false)
///     .with_dtype(Precision::BF16);
/// assert!(!opts.fold_ln);
/// assert!(opts.center_unembed);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)] // one flag per weight-processing step
pub struct PretrainedOptions {
    /// Fold layer-norm weights into the following linear maps.
    pub fold_ln: bool,
    /// Remove the mean of every residual-writing weight.
    pub center_writing_weights: bool,
    /// Remove the mean of the unembedding over the vocabulary.
    pub center_unembed: bool,
    /// Fold value biases into the attention output bias.
    pub fold_value_biases: bool,
    /// Parameter precision.
    pub dtype: Precision,
    /// Device placement.
    pub device: DeviceSpec,
    /// Hub revision (branch, tag or commit).
    pub revision: String,
    /// Requested quantization scheme; any value is rejected.
    pub quantization: Option<String>,
}

impl Default for PretrainedOptions {
    fn default() -> Self {
        Self {
            fold_ln: true,
            center_writing_weights: true,
            center_unembed: true,
            fold_value_biases: true,
            dtype: Precision::F32,
            device: DeviceSpec::Cpu,
            revision: "main".to_owned(),
            quantization: None,
        }
    }
}

impl PretrainedOptions {
    /// Options with every weight-processing step disabled.
    #[must_use]
    pub fn no_processing() -> Self {
        Self {
            fold_ln: false,
            center_writing_weights: false,
            center_unembed: false,
            fold_value_biases: false,
            ..Self::default()
        }
    }

    /// Set [`fold_ln`](Self::fold_ln).
    #[must_use]
    pub const fn with_fold_ln(mut self, on: bool) -> Self {
        self.fold_ln = on;
        self
    }

    /// Set [`center_writing_weights`](Self::center_writing_weights).
    #[must_use]
    pub const fn with_center_writing_weights(mut self, on: bool) -> Self {
        self.center_writing_weights = on;
        self
    }

    /// Set [`center_unembed`](Self::center_unembed).
    #[must_use]
    pub const fn with_center_unembed(mut self, on: bool) -> Self {
        self.center_unembed = on;
        self
    }

    /// Set [`fold_value_biases`](Self::fold_value_biases).
    #[must_use]
    pub const fn with_fold_value_biases(mut self, on: bool) -> Self {
        self.fold_value_biases = on;
        self
    }

    /// Set the parameter precision.
    #[must_use]
    pub const fn with_dtype(mut self, dtype: Precision) -> Self {
        self.dtype = dtype;
        self
    }

    /// Set the device.
    #[must_use]
    pub const fn with_device(mut self, device: DeviceSpec) -> Self {
        self.device = device;
        self
    }

    /// Set the hub revision.
    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    /// Request a quantization scheme (rejected at load time).
    #[must_use]
    pub fn with_quantization(mut self, scheme: impl Into<String>) -> Self {
        self.quantization = Some(scheme.into());
        self
    }

    /// Whether any weight-processing step is enabled.
    #[must_use]
    pub const fn any_processing(&self) -> bool {
        self.fold_ln || self.center_writing_weights || self.center_unembed || self.fold_value_biases
    }

    /// Reject unsupported requests before touching the network.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::UnsupportedQuantization`] if quantization was requested.
    pub fn check(&self) -> Result<()> {
        match &self.quantization {
            Some(scheme) => Err(LensError::UnsupportedQuantization(format!(
                "'{scheme}' requested; load full-precision weights instead"
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve() {
        assert_eq!(get_official_model_name("gpt2").unwrap(), "gpt2");
        assert_eq!(get_official_model_name("GPT2-Small").unwrap(), "gpt2");
        assert_eq!(get_official_model_name("distil-gpt2").unwrap(), "distilgpt2");
        assert_eq!(
            get_official_model_name("eleutherai/pythia-160m").unwrap(),
            "EleutherAI/pythia-160m"
        );
    }

    #[test]
    fn unknown_name_suggests_neighbours() {
        let err = get_official_model_name("gpt3-small").unwrap_err();
        match err {
            LensError::UnknownCheckpoint { name, suggestions } => {
                assert_eq!(name, "gpt3-small");
                assert_eq!(suggestions.first().map(String::as_str), Some("gpt2"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn nonsense_has_no_suggestions() {
        let err = get_official_model_name("zzzzzzzzzzzzzzzz").unwrap_err();
        assert!(matches!(
            err,
            LensError::UnknownCheckpoint { ref suggestions, .. } if suggestions.is_empty()
        ));
    }

    #[test]
    fn edit_distance_basics() {
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("gpt2", "gpt2"), 0);
    }

    #[test]
    fn quantization_is_rejected() {
        let opts = PretrainedOptions::default().with_quantization("int8");
        assert!(matches!(
            opts.check(),
            Err(LensError::UnsupportedQuantization(_))
        ));
        assert!(PretrainedOptions::no_processing().check().is_ok());
        assert!(!PretrainedOptions::no_processing().any_processing());
    }
}
