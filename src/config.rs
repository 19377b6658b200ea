// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model configuration and `HuggingFace` `config.json` parsing.
//!
//! [`HookedTransformerConfig`] is the single configuration record shared by
//! the decoder-only, encoder, and encoder-decoder models.  It uses the
//! instrumented vocabulary (`d_model`, `d_head`, `n_heads`, ...) and is
//! either built directly, deserialized from JSON, or derived from a
//! checkpoint's `config.json` via [`from_hf_config`](HookedTransformerConfig::from_hf_config).
//!
//! # Usage
//!
//! ```
//! use candle_lens::HookedTransformerConfig;
//!
//! let json = serde_json::json!({
//!     "model_type": "gpt2", "n_embd": 768, "n_layer": 12, "n_head": 12,
//!     "n_positions": 1024, "vocab_size": 50257,
//!     "activation_function": "gelu_new", "layer_norm_epsilon": 1e-5
//! });
//! let config = HookedTransformerConfig::from_hf_config(&json).unwrap();
//! assert_eq!(config.d_head, 64);
//! assert_eq!(config.d_mlp, 3072);
//! ```

use std::fmt;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LensError, Result};

// ---------------------------------------------------------------------------
// Configuration enums
// ---------------------------------------------------------------------------

/// Normalization variant applied before (or after) each sublayer.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizationType {
    /// Layer norm with learned weight and bias.
    #[serde(rename = "LN")]
    LayerNorm,
    /// Layer norm without affine parameters (after folding them away).
    #[serde(rename = "LNPre")]
    LayerNormPre,
    /// RMS norm with learned weight.
    #[serde(rename = "RMS")]
    RmsNorm,
    /// RMS norm without weight (after folding it away).
    #[serde(rename = "RMSPre")]
    RmsNormPre,
    /// No normalization.
    #[serde(rename = "None")]
    Identity,
}

impl NormalizationType {
    /// Whether the variant subtracts the mean (LayerNorm family).
    #[must_use]
    pub const fn centers(self) -> bool {
        matches!(self, Self::LayerNorm | Self::LayerNormPre)
    }

    /// Whether the variant carries learned parameters.
    #[must_use]
    pub const fn has_weight(self) -> bool {
        matches!(self, Self::LayerNorm | Self::RmsNorm)
    }

    /// Whether the variant carries a learned bias.
    #[must_use]
    pub const fn has_bias(self) -> bool {
        matches!(self, Self::LayerNorm)
    }

    /// The parameter-free counterpart produced by layer-norm folding.
    #[must_use]
    pub const fn folded(self) -> Self {
        match self {
            Self::LayerNorm | Self::LayerNormPre => Self::LayerNormPre,
            Self::RmsNorm | Self::RmsNormPre => Self::RmsNormPre,
            Self::Identity => Self::Identity,
        }
    }
}

impl fmt::Display for NormalizationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LayerNorm => write!(f, "LN"),
            Self::LayerNormPre => write!(f, "LNPre"),
            Self::RmsNorm => write!(f, "RMS"),
            Self::RmsNormPre => write!(f, "RMSPre"),
            Self::Identity => write!(f, "None"),
        }
    }
}

/// Activation function used in the MLP.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationFunction {
    /// Exact (erf) GELU.
    Gelu,
    /// Tanh-approximated GELU (`gelu_new` in GPT-2).
    GeluNew,
    /// Rectified linear unit.
    Relu,
    /// Sigmoid linear unit.
    Silu,
}

impl ActivationFunction {
    /// Map a `HuggingFace` activation name onto an [`ActivationFunction`].
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for unknown names.
    pub fn from_hf_name(name: &str) -> Result<Self> {
        match name {
            "gelu" => Ok(Self::Gelu),
            "gelu_new" | "gelu_fast" | "gelu_pytorch_tanh" | "gelu_approx" => Ok(Self::GeluNew),
            "relu" => Ok(Self::Relu),
            "silu" | "swish" => Ok(Self::Silu),
            other => Err(LensError::Config(format!(
                "unsupported activation function '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ActivationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gelu => write!(f, "gelu"),
            Self::GeluNew => write!(f, "gelu_new"),
            Self::Relu => write!(f, "relu"),
            Self::Silu => write!(f, "silu"),
        }
    }
}

/// How token positions enter the model.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionalEmbeddingType {
    /// Learned absolute position embedding added to the residual stream.
    Standard,
    /// Rotary embedding applied to queries and keys.
    Rotary,
    /// T5-style bucketed relative position bias on attention scores.
    Relative,
}

/// Architecture family a checkpoint comes from.
///
/// Determines the weight conversion and the block wiring.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    /// `GPT2LMHeadModel`.
    Gpt2,
    /// `GPTNeoXForCausalLM` (Pythia).
    GptNeoX,
    /// `LlamaForCausalLM`.
    Llama,
    /// `MistralForCausalLM`.
    Mistral,
    /// `Qwen2ForCausalLM`.
    Qwen2,
    /// `BertForMaskedLM`.
    Bert,
    /// `T5ForConditionalGeneration`.
    T5,
}

impl Architecture {
    /// Whether the family is decoder-only.
    #[must_use]
    pub const fn is_decoder_only(self) -> bool {
        !matches!(self, Self::Bert | Self::T5)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gpt2 => "GPT2LMHeadModel",
            Self::GptNeoX => "GPTNeoXForCausalLM",
            Self::Llama => "LlamaForCausalLM",
            Self::Mistral => "MistralForCausalLM",
            Self::Qwen2 => "Qwen2ForCausalLM",
            Self::Bert => "BertForMaskedLM",
            Self::T5 => "T5ForConditionalGeneration",
        };
        write!(f, "{name}")
    }
}

/// Floating point precision of the model parameters.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit float.
    #[default]
    F32,
    /// 16-bit float.
    F16,
    /// Brain float 16.
    BF16,
}

impl Precision {
    /// The candle dtype for this precision.
    #[must_use]
    pub const fn dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::BF16 => DType::BF16,
        }
    }
}

/// Where the model should live.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSpec {
    /// Host memory.
    #[default]
    Cpu,
    /// CUDA device with the given ordinal.
    Cuda(usize),
    /// Metal device with the given ordinal.
    Metal(usize),
    /// CUDA GPU 0 when available, CPU otherwise.
    Auto,
}

impl DeviceSpec {
    /// Resolve to a concrete candle [`Device`].
    ///
    /// # Errors
    ///
    /// Returns [`LensError::DeviceUnavailable`] when an explicitly requested
    /// accelerator is not compiled in or not present.
    pub fn resolve(self) -> Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Auto => Device::cuda_if_available(0)
                .map_err(|e| LensError::DeviceUnavailable(format!("auto device selection: {e}"))),
            Self::Cuda(ordinal) => {
                if !candle_core::utils::cuda_is_available() {
                    return Err(LensError::DeviceUnavailable(format!(
                        "cuda:{ordinal} requested but this build has no CUDA support"
                    )));
                }
                Device::new_cuda(ordinal)
                    .map_err(|e| LensError::DeviceUnavailable(format!("cuda:{ordinal}: {e}")))
            }
            Self::Metal(ordinal) => {
                if !candle_core::utils::metal_is_available() {
                    return Err(LensError::DeviceUnavailable(format!(
                        "metal:{ordinal} requested but this build has no Metal support"
                    )));
                }
                Device::new_metal(ordinal)
                    .map_err(|e| LensError::DeviceUnavailable(format!("metal:{ordinal}: {e}")))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RoPE frequency scaling
// ---------------------------------------------------------------------------

/// Llama-3 frequency scaling for rotary embeddings.
///
/// Frequencies whose wavelength is shorter than
/// `original_max_position_embeddings / high_freq_factor` are kept,
/// those longer than `original_max_position_embeddings / low_freq_factor`
/// are divided by `factor`, and the band in between is interpolated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RopeScaling {
    /// Divisor applied to low frequencies.
    pub factor: f64,
    /// Lower edge of the interpolated band, as a context-length divisor.
    pub low_freq_factor: f64,
    /// Upper edge of the interpolated band, as a context-length divisor.
    pub high_freq_factor: f64,
    /// Context length the checkpoint was pre-trained with.
    pub original_max_position_embeddings: usize,
}

impl RopeScaling {
    /// Scale one inverse frequency.
    #[must_use]
    pub fn scale(&self, inv_freq: f64) -> f64 {
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let old_ctx = self.original_max_position_embeddings as f64;
        let low_freq_wavelen = old_ctx / self.low_freq_factor;
        let high_freq_wavelen = old_ctx / self.high_freq_factor;
        let wavelen = 2.0 * std::f64::consts::PI / inv_freq;
        if wavelen < high_freq_wavelen {
            inv_freq
        } else if wavelen > low_freq_wavelen {
            inv_freq / self.factor
        } else {
            let smooth = (old_ctx / wavelen - self.low_freq_factor)
                / (self.high_freq_factor - self.low_freq_factor);
            (1.0 - smooth) * inv_freq / self.factor + smooth * inv_freq
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.factor > 0.0
            && self.low_freq_factor > 0.0
            && self.high_freq_factor > self.low_freq_factor
            && self.original_max_position_embeddings > 0)
        {
            return Err(LensError::Config(format!(
                "invalid llama3 rope scaling: {self:?}"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HookedTransformerConfig
// ---------------------------------------------------------------------------

/// Configuration for every hooked model in this crate.
///
/// Fields follow the instrumented naming used throughout the crate.
/// Construct one with [`HookedTransformerConfig::new`] and struct-update
/// syntax, deserialize it from JSON, or derive it from a checkpoint with
/// [`from_hf_config`](Self::from_hf_config).  Call
/// [`validate`](Self::validate) after manual construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)] // Config structs legitimately have many boolean axes
pub struct HookedTransformerConfig {
    // --- Dimensions ----------------------------------------------------------
    /// Residual stream width.
    pub d_model: usize,
    /// Per-head dimension.
    pub d_head: usize,
    /// Number of query heads.
    pub n_heads: usize,
    /// Number of key/value heads (grouped-query attention when smaller
    /// than `n_heads`).
    pub n_key_value_heads: usize,
    /// Number of blocks (per stack for encoder-decoder models).
    pub n_layers: usize,
    /// Maximum context length.
    pub n_ctx: usize,
    /// MLP hidden width.
    pub d_mlp: usize,
    /// Input vocabulary size.
    pub d_vocab: usize,
    /// Output vocabulary size.
    pub d_vocab_out: usize,

    // --- Architecture axes ---------------------------------------------------
    /// MLP activation function.
    pub act_fn: ActivationFunction,
    /// Normalization variant.
    pub normalization_type: NormalizationType,
    /// Epsilon for normalization layers.
    pub eps: f64,
    /// Positional information scheme.
    pub positional_embedding_type: PositionalEmbeddingType,
    /// Number of leading head dims rotated by the rotary embedding.
    pub rotary_dim: usize,
    /// Rotary base frequency.
    pub rotary_base: f64,
    /// Llama-3 frequency scaling, when the checkpoint uses it.
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    /// Whether the MLP is gated (`act(x W_gate) * x W_in`).
    pub gated_mlp: bool,
    /// Whether attention and MLP read the same residual (GPT-J / NeoX).
    pub parallel_attn_mlp: bool,
    /// Whether blocks have no MLP.
    pub attn_only: bool,
    /// Whether attention scores are scaled by `1/sqrt(d_head)`.
    pub use_attn_scale: bool,
    /// Whether per-head outputs are computed and exposed at `hook_result`.
    pub use_attn_result: bool,
    /// Whether the unembedding shares the token embedding in the checkpoint.
    pub tie_word_embeddings: bool,
    /// Source architecture, when the model came from a checkpoint.
    pub original_architecture: Option<Architecture>,

    // --- Relative attention (T5) ---------------------------------------------
    /// Number of relative position buckets.
    pub relative_attention_num_buckets: usize,
    /// Largest distance distinguished by the buckets.
    pub relative_attention_max_distance: usize,

    // --- Tokenizer -----------------------------------------------------------
    /// Tokenizer repository or path.
    pub tokenizer_name: Option<String>,
    /// Whether string inputs get a BOS token by default.
    pub default_prepend_bos: bool,
    /// BOS token id, if the tokenizer has one.
    pub bos_token_id: Option<u32>,
    /// Token that ends generation.
    #[serde(default)]
    pub eos_token_id: Option<u32>,
    /// Token that starts decoder input (encoder-decoder models).
    pub decoder_start_token_id: Option<u32>,

    // --- Initialisation and placement ------------------------------------------
    /// Standard deviation for random initialisation.
    pub init_range: f64,
    /// Parameter precision.
    pub dtype: Precision,
    /// Device placement.
    pub device: DeviceSpec,
}

impl HookedTransformerConfig {
    /// Create a config with derived defaults for the given core dimensions.
    ///
    /// Defaults: standard positional embedding, LayerNorm, `gelu_new`,
    /// `d_mlp = 4 * d_model`, `n_key_value_heads = n_heads`,
    /// `d_vocab_out = d_vocab`, `init_range = 0.8 / sqrt(d_model)`.
    #[must_use]
    pub fn new(
        n_layers: usize,
        d_model: usize,
        n_ctx: usize,
        d_head: usize,
        n_heads: usize,
        d_vocab: usize,
    ) -> Self {
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let init_range = 0.8 / (d_model.max(1) as f64).sqrt();
        Self {
            d_model,
            d_head,
            n_heads,
            n_key_value_heads: n_heads,
            n_layers,
            n_ctx,
            d_mlp: 4 * d_model,
            d_vocab,
            d_vocab_out: d_vocab,
            act_fn: ActivationFunction::GeluNew,
            normalization_type: NormalizationType::LayerNorm,
            eps: 1e-5,
            positional_embedding_type: PositionalEmbeddingType::Standard,
            rotary_dim: d_head,
            rotary_base: 10_000.0,
            rope_scaling: None,
            gated_mlp: false,
            parallel_attn_mlp: false,
            attn_only: false,
            use_attn_scale: true,
            use_attn_result: false,
            tie_word_embeddings: false,
            original_architecture: None,
            relative_attention_num_buckets: 32,
            relative_attention_max_distance: 128,
            tokenizer_name: None,
            default_prepend_bos: true,
            bos_token_id: None,
            eos_token_id: None,
            decoder_start_token_id: None,
            init_range,
            dtype: Precision::F32,
            device: DeviceSpec::Cpu,
        }
    }

    /// Check internal consistency of the dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.n_heads == 0 || self.d_head == 0 || self.d_model == 0 {
            return Err(LensError::Config(
                "d_model, d_head and n_heads must all be positive".into(),
            ));
        }
        if self.d_vocab == 0 || self.d_vocab_out == 0 {
            return Err(LensError::Config("vocabulary sizes must be positive".into()));
        }
        if self.n_key_value_heads == 0 || self.n_heads % self.n_key_value_heads != 0 {
            return Err(LensError::Config(format!(
                "n_heads ({}) must be a multiple of n_key_value_heads ({})",
                self.n_heads, self.n_key_value_heads
            )));
        }
        if self.positional_embedding_type == PositionalEmbeddingType::Rotary
            && (self.rotary_dim > self.d_head || self.rotary_dim % 2 != 0)
        {
            return Err(LensError::Config(format!(
                "rotary_dim ({}) must be even and at most d_head ({})",
                self.rotary_dim, self.d_head
            )));
        }
        if let Some(scaling) = &self.rope_scaling {
            scaling.validate()?;
        }
        if !self.attn_only && self.d_mlp == 0 {
            return Err(LensError::Config("d_mlp must be positive unless attn_only".into()));
        }
        Ok(())
    }

    /// Number of query heads per key/value head.
    #[must_use]
    pub const fn kv_repeats(&self) -> usize {
        self.n_heads / self.n_key_value_heads
    }

    /// Parse a config from a JSON string in the crate's own format.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] on malformed JSON or invalid dimensions.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)
            .map_err(|e| LensError::Config(format!("parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the config to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if serialization fails.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| LensError::Config(format!("serialize config: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Config parsing: entry point
// ---------------------------------------------------------------------------

impl HookedTransformerConfig {
    /// Derive a config from a `HuggingFace` `config.json` value.
    ///
    /// Dispatches on the `model_type` field to a family-specific parser.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if `model_type` is missing or
    /// unsupported, or if required fields are absent.
    pub fn from_hf_config(config: &Value) -> Result<Self> {
        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .ok_or_else(|| LensError::Config("missing 'model_type' field".into()))?;

        let parsed = match model_type {
            "gpt2" => Self::parse_gpt2(config),
            "gpt_neox" => Self::parse_gpt_neox(config),
            "llama" => Self::parse_llama_family(config, Architecture::Llama),
            "mistral" => Self::parse_llama_family(config, Architecture::Mistral),
            "qwen2" => Self::parse_llama_family(config, Architecture::Qwen2),
            "bert" => Self::parse_bert(config),
            "t5" => Self::parse_t5(config),
            other => Err(LensError::Config(format!(
                "unsupported model_type: '{other}'"
            ))),
        }?;
        parsed.validate()?;
        Ok(parsed)
    }
}

// ---------------------------------------------------------------------------
// Per-family config parsers
// ---------------------------------------------------------------------------

impl HookedTransformerConfig {
    /// Parse a GPT-2 config: learned positions, LayerNorm, `gelu_new`.
    fn parse_gpt2(config: &Value) -> Result<Self> {
        let d_model = get_usize(config, "n_embd")?;
        let n_heads = get_usize(config, "n_head")?;
        let d_vocab = get_usize(config, "vocab_size")?;

        let mut cfg = Self::new(
            get_usize(config, "n_layer")?,
            d_model,
            get_usize_or(config, "n_positions", 1024),
            head_dim(d_model, n_heads)?,
            n_heads,
            d_vocab,
        );
        cfg.d_mlp = get_optional_usize(config, "n_inner").unwrap_or(4 * d_model);
        cfg.act_fn = ActivationFunction::from_hf_name(
            config
                .get("activation_function")
                .and_then(Value::as_str)
                .unwrap_or("gelu_new"),
        )?;
        cfg.eps = get_f64_or(config, "layer_norm_epsilon", 1e-5);
        cfg.tie_word_embeddings = true;
        cfg.original_architecture = Some(Architecture::Gpt2);
        cfg.bos_token_id = get_optional_u32(config, "bos_token_id");
        cfg.eos_token_id = get_token_id(config, "eos_token_id");
        Ok(cfg)
    }

    /// Parse a GPT-NeoX (Pythia) config: partial rotary, parallel residual.
    fn parse_gpt_neox(config: &Value) -> Result<Self> {
        let d_model = get_usize(config, "hidden_size")?;
        let n_heads = get_usize(config, "num_attention_heads")?;
        let d_head = head_dim(d_model, n_heads)?;

        let mut cfg = Self::new(
            get_usize(config, "num_hidden_layers")?,
            d_model,
            get_usize_or(config, "max_position_embeddings", 2048),
            d_head,
            n_heads,
            get_usize(config, "vocab_size")?,
        );
        cfg.d_mlp = get_usize_or(config, "intermediate_size", 4 * d_model);
        cfg.act_fn = ActivationFunction::from_hf_name(
            config.get("hidden_act").and_then(Value::as_str).unwrap_or("gelu"),
        )?;
        cfg.eps = get_f64_or(config, "layer_norm_eps", 1e-5);
        cfg.positional_embedding_type = PositionalEmbeddingType::Rotary;
        let rotary_pct = get_f64_or(config, "rotary_pct", 1.0);
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::as_conversions
        )]
        let rotary_dim = ((d_head as f64) * rotary_pct).round() as usize;
        cfg.rotary_dim = rotary_dim - rotary_dim % 2;
        cfg.rotary_base = get_f64_or(config, "rotary_emb_base", 10_000.0);
        cfg.rope_scaling = parse_rope_scaling(config)?;
        cfg.parallel_attn_mlp = get_bool_or(config, "use_parallel_residual", true);
        cfg.tie_word_embeddings = get_bool_or(config, "tie_word_embeddings", false);
        cfg.original_architecture = Some(Architecture::GptNeoX);
        cfg.bos_token_id = get_optional_u32(config, "bos_token_id");
        cfg.eos_token_id = get_token_id(config, "eos_token_id");
        Ok(cfg)
    }

    /// Parse a LLaMA-family config (LLaMA, Mistral, Qwen2): RMS norm,
    /// full rotary, gated `SiLU` MLP, grouped-query attention.
    fn parse_llama_family(config: &Value, arch: Architecture) -> Result<Self> {
        let d_model = get_usize(config, "hidden_size")?;
        let n_heads = get_usize(config, "num_attention_heads")?;
        let d_head = match get_optional_usize(config, "head_dim") {
            Some(explicit) => explicit,
            None => head_dim(d_model, n_heads)?,
        };

        let mut cfg = Self::new(
            get_usize(config, "num_hidden_layers")?,
            d_model,
            get_usize_or(config, "max_position_embeddings", 4096),
            d_head,
            n_heads,
            get_usize(config, "vocab_size")?,
        );
        cfg.n_key_value_heads = get_usize_or(config, "num_key_value_heads", n_heads);
        cfg.d_mlp = get_usize(config, "intermediate_size")?;
        cfg.act_fn = ActivationFunction::from_hf_name(
            config.get("hidden_act").and_then(Value::as_str).unwrap_or("silu"),
        )?;
        cfg.normalization_type = NormalizationType::RmsNorm;
        cfg.eps = get_f64_or(config, "rms_norm_eps", 1e-5);
        cfg.positional_embedding_type = PositionalEmbeddingType::Rotary;
        cfg.rotary_dim = d_head;
        cfg.rotary_base = get_f64_or(config, "rope_theta", 10_000.0);
        cfg.rope_scaling = parse_rope_scaling(config)?;
        cfg.gated_mlp = true;
        cfg.tie_word_embeddings = get_bool_or(config, "tie_word_embeddings", false);
        cfg.original_architecture = Some(arch);
        cfg.bos_token_id = get_optional_u32(config, "bos_token_id");
        cfg.eos_token_id = get_token_id(config, "eos_token_id");
        if arch == Architecture::Qwen2 {
            cfg.default_prepend_bos = false;
        }
        Ok(cfg)
    }

    /// Parse a BERT config: post-norm encoder with learned positions.
    fn parse_bert(config: &Value) -> Result<Self> {
        let d_model = get_usize(config, "hidden_size")?;
        let n_heads = get_usize(config, "num_attention_heads")?;

        let mut cfg = Self::new(
            get_usize(config, "num_hidden_layers")?,
            d_model,
            get_usize_or(config, "max_position_embeddings", 512),
            head_dim(d_model, n_heads)?,
            n_heads,
            get_usize(config, "vocab_size")?,
        );
        cfg.d_mlp = get_usize_or(config, "intermediate_size", 4 * d_model);
        cfg.act_fn = ActivationFunction::from_hf_name(
            config.get("hidden_act").and_then(Value::as_str).unwrap_or("gelu"),
        )?;
        cfg.eps = get_f64_or(config, "layer_norm_eps", 1e-12);
        cfg.tie_word_embeddings = true;
        cfg.original_architecture = Some(Architecture::Bert);
        cfg.bos_token_id = get_optional_u32(config, "bos_token_id");
        cfg.eos_token_id = get_token_id(config, "eos_token_id");
        Ok(cfg)
    }

    /// Parse a T5 config: RMS norm, relative position bias, unscaled attention.
    fn parse_t5(config: &Value) -> Result<Self> {
        let d_model = get_usize(config, "d_model")?;
        let n_heads = get_usize(config, "num_heads")?;
        let d_head = match get_optional_usize(config, "d_kv") {
            Some(explicit) => explicit,
            None => head_dim(d_model, n_heads)?,
        };

        let n_layers = get_usize(config, "num_layers")?;
        let n_decoder_layers = get_usize_or(config, "num_decoder_layers", n_layers);
        if n_decoder_layers != n_layers {
            return Err(LensError::Config(format!(
                "T5 stacks of different depth ({n_layers} encoder, {n_decoder_layers} decoder) \
                 are not supported"
            )));
        }

        let mut cfg = Self::new(
            n_layers,
            d_model,
            get_usize_or(config, "n_positions", 512),
            d_head,
            n_heads,
            get_usize(config, "vocab_size")?,
        );
        cfg.d_mlp = get_usize(config, "d_ff")?;
        let feed_forward = config
            .get("feed_forward_proj")
            .and_then(Value::as_str)
            .unwrap_or("relu");
        let (gated, act_name) = match feed_forward.strip_prefix("gated-") {
            Some(act) => (true, act),
            None => (false, feed_forward),
        };
        cfg.gated_mlp = gated;
        // `gated-gelu` checkpoints use the tanh approximation.
        cfg.act_fn = match (gated, act_name) {
            (true, "gelu") => ActivationFunction::GeluNew,
            _ => ActivationFunction::from_hf_name(act_name)?,
        };
        cfg.normalization_type = NormalizationType::RmsNorm;
        cfg.eps = get_f64_or(config, "layer_norm_epsilon", 1e-6);
        cfg.positional_embedding_type = PositionalEmbeddingType::Relative;
        cfg.use_attn_scale = false;
        cfg.relative_attention_num_buckets =
            get_usize_or(config, "relative_attention_num_buckets", 32);
        cfg.relative_attention_max_distance =
            get_usize_or(config, "relative_attention_max_distance", 128);
        cfg.tie_word_embeddings = get_bool_or(config, "tie_word_embeddings", true);
        cfg.original_architecture = Some(Architecture::T5);
        cfg.default_prepend_bos = false;
        cfg.eos_token_id = get_token_id(config, "eos_token_id");
        cfg.decoder_start_token_id = get_optional_u32(config, "decoder_start_token_id").or(Some(0));
        Ok(cfg)
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field from a JSON object.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| LensError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| LensError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    get_optional_usize(config, key).unwrap_or(default)
}

/// Extract an optional `usize` field, returning `None` if absent or null.
fn get_optional_usize(config: &Value, key: &str) -> Option<usize> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
}

/// Extract an optional `u32` field (token ids).
fn get_optional_u32(config: &Value, key: &str) -> Option<u32> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}

/// Extract a token id stored either as an integer or as a list whose
/// first entry is used.
fn get_token_id(config: &Value, key: &str) -> Option<u32> {
    let value = config.get(key)?;
    let first = match value.as_array() {
        Some(ids) => ids.first()?,
        None => value,
    };
    first.as_u64().and_then(|v| u32::try_from(v).ok())
}

/// Read `rope_scaling`, accepting only the llama3 scheme.
fn parse_rope_scaling(config: &Value) -> Result<Option<RopeScaling>> {
    let Some(scaling) = config.get("rope_scaling").filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let rope_type = scaling
        .get("rope_type")
        .or_else(|| scaling.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("default");
    match rope_type {
        "default" => Ok(None),
        "llama3" => {
            let field = |key: &str| {
                scaling.get(key).and_then(Value::as_f64).ok_or_else(|| {
                    LensError::Config(format!("rope_scaling is missing field '{key}'"))
                })
            };
            let scaling = RopeScaling {
                factor: field("factor")?,
                low_freq_factor: field("low_freq_factor")?,
                high_freq_factor: field("high_freq_factor")?,
                original_max_position_embeddings: get_usize(
                    scaling,
                    "original_max_position_embeddings",
                )?,
            };
            scaling.validate()?;
            Ok(Some(scaling))
        }
        other => Err(LensError::Config(format!(
            "unsupported rope_scaling type '{other}'"
        ))),
    }
}

/// Extract an `f64` field, returning a default if absent.
fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Extract a `bool` field, returning a default if absent.
fn get_bool_or(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// `d_model / n_heads`, rejecting zero heads.
fn head_dim(d_model: usize, n_heads: usize) -> Result<usize> {
    if n_heads == 0 {
        return Err(LensError::Config(
            "number of attention heads is 0, cannot compute d_head".into(),
        ));
    }
    Ok(d_model / n_heads)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
