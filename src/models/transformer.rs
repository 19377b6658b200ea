// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decoder-only hooked transformer.
//!
//! One implementation covers GPT-2, GPT-NeoX (Pythia) and the LLaMA
//! family; the differences live in [`HookedTransformerConfig`] axes
//! (positional scheme, norm type, gated MLP, parallel attention/MLP,
//! grouped-query attention).

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tracing::info;

use super::{ForwardOptions, ForwardOutput, ReturnType, load_pretrained};
use crate::cache::CacheMetadata;
use crate::components::{
    AttnInputs, Attention, Embed, Mlp, Norm, PosEmbed, RopeCache, TransformerBlock, Unembed,
};
use crate::config::{HookedTransformerConfig, PositionalEmbeddingType};
use crate::error::{LensError, Result};
use crate::hooks::{HookCache, HookContext, HookPoint, HookSpec, NormSite, Stack};
use crate::loading::{PretrainedOptions, StateDict, random_state_dict, validate_state_dict};
use crate::root::{HookRegistry, HookedRootModule};
use crate::tokenizer::{LensTokenizer, PaddingSide, TokenBatch};
use crate::util::loss::{mean_loss, per_token_loss};
use crate::util::masks::{causal_mask, padding_mask};
use crate::util::sampling::{SamplingOptions, sample_token};

use super::weights::HookedWeights;

/// A decoder-only language model whose forward pass runs through hook
/// points.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use candle_lens::{HookedRootModule, HookedTransformer, HookedTransformerConfig, HookPoint};
///
/// # fn main() -> candle_lens::Result<()> {
/// let cfg = HookedTransformerConfig::new(2, 16, 32, 4, 4, 50);
/// let model = HookedTransformer::random(cfg)?;
/// let tokens = Tensor::new(&[[1_u32, 2, 3]], &Device::Cpu)?;
/// let (logits, cache) = model.run_with_cache(&tokens, HookPoint::resid_post(1))?;
/// assert_eq!(logits.dims(), &[1, 3, 50]);
/// assert!(cache.contains(&HookPoint::resid_post(1)));
/// # Ok(())
/// # }
/// ```
pub struct HookedTransformer {
    cfg: HookedTransformerConfig,
    embed: Embed,
    /// Standard positional embedding only.
    pos_embed: Option<PosEmbed>,
    blocks: Vec<TransformerBlock>,
    ln_final: Norm,
    unembed: Unembed,
    /// Rotary positional embedding only.
    rope: Option<RopeCache>,
    registry: HookRegistry,
    tokenizer: Option<LensTokenizer>,
    device: Device,
}

impl HookedTransformer {
    /// Build the model from parameters with instrumented names.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for an invalid config or an encoder
    /// architecture, and [`LensError::Model`] on a missing or misshapen
    /// parameter.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(cfg: HookedTransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        cfg.validate()?;
        if cfg.original_architecture.is_some_and(|a| !a.is_decoder_only()) {
            return Err(LensError::Config(
                "HookedTransformer only builds decoder-only architectures".into(),
            ));
        }
        let device = vb.device().clone();
        let pos_embed = match cfg.positional_embedding_type {
            PositionalEmbeddingType::Standard => Some(PosEmbed::load(&cfg, vb.pp("pos_embed"))?),
            PositionalEmbeddingType::Rotary => None,
            PositionalEmbeddingType::Relative => {
                return Err(LensError::Config(
                    "relative position bias is only supported by HookedEncoderDecoder".into(),
                ));
            }
        };
        let rope = if cfg.positional_embedding_type == PositionalEmbeddingType::Rotary {
            Some(RopeCache::new(
                cfg.rotary_dim,
                cfg.n_ctx,
                cfg.rotary_base,
                cfg.rope_scaling.as_ref(),
                &device,
                vb.dtype(),
            )?)
        } else {
            None
        };
        let blocks = (0..cfg.n_layers)
            .map(|l| TransformerBlock::load(&cfg, l, vb.pp(format!("blocks.{l}"))))
            .collect::<Result<Vec<_>>>()?;
        let ln_final = Norm::load(
            cfg.normalization_type,
            cfg.d_model,
            cfg.eps,
            NormSite::Final(Stack::Blocks),
            vb.pp("ln_final"),
        )?;
        info!(
            layers = cfg.n_layers,
            d_model = cfg.d_model,
            heads = cfg.n_heads,
            "built HookedTransformer"
        );
        Ok(Self {
            embed: Embed::load(&cfg, vb.pp("embed"))?,
            pos_embed,
            blocks,
            ln_final,
            unembed: Unembed::load(&cfg, vb.pp("unembed"))?,
            rope,
            registry: HookRegistry::new(),
            tokenizer: None,
            device,
            cfg,
        })
    }

    /// Build the model from a state dict, placing it on `cfg.device` in
    /// `cfg.dtype`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::MissingWeight`] or [`LensError::ShapeMismatch`]
    /// if the state dict does not match the config, and
    /// [`LensError::DeviceUnavailable`] if the device cannot be used.
    pub fn from_state_dict(cfg: HookedTransformerConfig, state_dict: StateDict) -> Result<Self> {
        cfg.validate()?;
        validate_state_dict(&cfg, &state_dict)?;
        let device = cfg.device.resolve()?;
        let vb = VarBuilder::from_tensors(state_dict, cfg.dtype.dtype(), &device);
        Self::new(cfg, vb)
    }

    /// An untrained model with randomly initialised parameters.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for an invalid config.
    pub fn random(cfg: HookedTransformerConfig) -> Result<Self> {
        cfg.validate()?;
        let device = cfg.device.resolve()?;
        let state_dict = random_state_dict(&cfg, &device)?;
        Self::from_state_dict(cfg, state_dict)
    }

    /// Load a pretrained checkpoint by official name, alias, or local
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::UnknownCheckpoint`] for unknown names,
    /// [`LensError::UnsupportedQuantization`] if quantization is requested,
    /// [`LensError::Config`] for encoder checkpoints, and loader errors.
    pub fn from_pretrained(name: &str, opts: &PretrainedOptions) -> Result<Self> {
        let pretrained = load_pretrained(
            name,
            opts,
            |cfg| cfg.original_architecture.is_some_and(|a| a.is_decoder_only()),
            "HookedEncoder or HookedEncoderDecoder",
        )?;
        let bos = pretrained.cfg.bos_token_id;
        let mut model = Self::from_state_dict(pretrained.cfg, pretrained.state_dict)?;
        if let Some(path) = pretrained.tokenizer {
            model.tokenizer = Some(LensTokenizer::from_file(path, bos)?);
        }
        Ok(model)
    }

    /// Attach a tokenizer.
    #[must_use]
    pub fn with_tokenizer(mut self, tokenizer: LensTokenizer) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// The model configuration.
    #[must_use]
    pub const fn cfg(&self) -> &HookedTransformerConfig {
        &self.cfg
    }

    /// Device holding the parameters.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// The attached tokenizer, if any.
    #[must_use]
    pub const fn tokenizer(&self) -> Option<&LensTokenizer> {
        self.tokenizer.as_ref()
    }

    /// Blocks in forward order.
    #[must_use]
    pub fn blocks(&self) -> &[TransformerBlock] {
        &self.blocks
    }

    // --- Forward -----------------------------------------------------------

    /// Run the model on `tokens` `[batch, pos]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if a loss is requested for a single
    /// position, and [`LensError::Model`] on tensor failures.
    pub fn forward(&self, tokens: &Tensor, return_type: ReturnType) -> Result<ForwardOutput> {
        let logits = self.run(tokens, &ForwardOptions::default(), &HookSpec::new())?.into_output();
        self.finish_output(logits, tokens, None, return_type)
    }

    /// Run the model with per-call options and instrumentation.
    ///
    /// The output tensor of the returned cache is the logits, or the
    /// residual stream when `opts.stop_at_layer` is set.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if `stop_at_layer` exceeds the number
    /// of layers, and propagates forward and hook errors.
    pub fn forward_with(
        &self,
        tokens: &Tensor,
        opts: &ForwardOptions,
        spec: &HookSpec,
    ) -> Result<HookCache> {
        self.run(tokens, opts, spec)
    }

    fn finish_output(
        &self,
        logits: Tensor,
        tokens: &Tensor,
        attention_mask: Option<&Tensor>,
        return_type: ReturnType,
    ) -> Result<ForwardOutput> {
        Ok(match return_type {
            ReturnType::Logits => ForwardOutput {
                logits: Some(logits),
                loss: None,
            },
            ReturnType::Loss => ForwardOutput {
                loss: Some(self.loss_fn(&logits, tokens, attention_mask, false)?),
                logits: None,
            },
            ReturnType::PerTokenLoss => ForwardOutput {
                loss: Some(self.loss_fn(&logits, tokens, attention_mask, true)?),
                logits: None,
            },
            ReturnType::Both => ForwardOutput {
                loss: Some(self.loss_fn(&logits, tokens, attention_mask, false)?),
                logits: Some(logits),
            },
            ReturnType::None => ForwardOutput::default(),
        })
    }

    /// Next-token cross-entropy of `logits` against `tokens`.
    ///
    /// With `per_token` the result is `[batch, pos - 1]`; otherwise the
    /// mean over real (unpadded) targets.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for fewer than two positions.
    pub fn loss_fn(
        &self,
        logits: &Tensor,
        tokens: &Tensor,
        attention_mask: Option<&Tensor>,
        per_token: bool,
    ) -> Result<Tensor> {
        let losses = per_token_loss(logits, tokens)?;
        if per_token {
            return Ok(losses);
        }
        mean_loss(&losses, attention_mask)
    }

    fn run(&self, tokens: &Tensor, opts: &ForwardOptions, spec: &HookSpec) -> Result<HookCache> {
        let (_, seq_len) = tokens.dims2()?;
        if self.pos_embed.is_some() && seq_len > self.cfg.n_ctx {
            return Err(LensError::Config(format!(
                "sequence of {seq_len} tokens exceeds n_ctx = {}",
                self.cfg.n_ctx
            )));
        }
        let stop = opts.stop_at_layer.unwrap_or(self.cfg.n_layers);
        if stop > self.cfg.n_layers {
            return Err(LensError::Config(format!(
                "stop_at_layer {stop} exceeds n_layers = {}",
                self.cfg.n_layers
            )));
        }
        let tokens = tokens.to_device(&self.device)?;
        let mut ctx = HookContext::new(self.registry.snapshot(), spec);

        let mut resid = self.embed.forward(&tokens, &mut ctx)?;
        if let Some(pos_embed) = &self.pos_embed {
            let mask = opts.attention_mask.as_ref();
            resid = (resid + pos_embed.forward(&tokens, mask, &mut ctx)?)?;
        }

        let mut mask = causal_mask(seq_len, &self.device, DType::F32)?;
        if let Some(attention_mask) = &opts.attention_mask {
            let padding = padding_mask(&attention_mask.to_device(&self.device)?, DType::F32)?;
            mask = mask.broadcast_add(&padding)?;
        }
        let inputs = AttnInputs {
            mask: Some(&mask),
            has_padding: opts.attention_mask.is_some(),
            rope: self.rope.as_ref(),
            position_bias: None,
        };

        for block in &self.blocks[..stop] {
            resid = block.forward(resid, inputs, &mut ctx)?;
        }
        if stop < self.cfg.n_layers {
            return Ok(ctx.finish(resid));
        }
        let normalized = self.ln_final.forward(&resid, &mut ctx)?;
        let logits = self.unembed.forward(&normalized)?;
        Ok(ctx.finish(logits))
    }

    // --- Generation --------------------------------------------------------

    /// Extend `tokens` `[batch, pos]` by up to `max_new_tokens`.
    ///
    /// Each step reruns the full sequence.  Generation stops early once
    /// every row has produced `eos_token_id`; finished rows are padded
    /// with it.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for a prompt without positions or if
    /// the sequence would exceed `n_ctx` for learned positions, and
    /// [`LensError::Model`] on tensor failures.
    pub fn generate(
        &self,
        tokens: &Tensor,
        max_new_tokens: usize,
        sampling: &SamplingOptions,
        eos_token_id: Option<u32>,
    ) -> Result<Tensor> {
        if tokens.dim(1)? == 0 {
            return Err(LensError::Config("cannot generate from an empty prompt".into()));
        }
        let mut rows: Vec<Vec<u32>> = tokens.to_dtype(DType::U32)?.to_vec2()?;
        let mut finished = vec![false; rows.len()];
        for _ in 0..max_new_tokens {
            let input = batch_tensor(&rows, &self.device)?;
            let logits = self.run(&input, &ForwardOptions::default(), &HookSpec::new())?.into_output();
            let last = logits.narrow(1, logits.dim(1)? - 1, 1)?.squeeze(1)?;
            for (i, row) in rows.iter_mut().enumerate() {
                let next = if finished[i] {
                    eos_token_id.unwrap_or(0)
                } else {
                    sample_token(&last.get(i)?, sampling)?
                };
                finished[i] |= eos_token_id == Some(next);
                row.push(next);
            }
            if finished.iter().all(|&f| f) {
                break;
            }
        }
        batch_tensor(&rows, &self.device)
    }

    /// Generate a continuation of `prompt` and decode it, stopping at
    /// `cfg.eos_token_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] without a tokenizer, and
    /// propagates generation errors.
    pub fn generate_text(
        &self,
        prompt: &str,
        max_new_tokens: usize,
        sampling: &SamplingOptions,
    ) -> Result<String> {
        let tokens = self.to_tokens(prompt, None)?;
        let prompt_len = tokens.dim(1)?;
        let out = self.generate(&tokens, max_new_tokens, sampling, self.cfg.eos_token_id)?;
        let ids: Vec<u32> = out.get(0)?.to_vec1()?;
        self.require_tokenizer()?.decode(&ids[prompt_len..])
    }

    // --- Tokenizer helpers -------------------------------------------------

    fn require_tokenizer(&self) -> Result<&LensTokenizer> {
        self.tokenizer
            .as_ref()
            .ok_or_else(|| LensError::Tokenizer("model has no tokenizer attached".into()))
    }

    /// Tokenize one string into `[1, pos]`.  `prepend_bos` defaults to
    /// `cfg.default_prepend_bos`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] without a tokenizer or on encoding
    /// failures.
    pub fn to_tokens(&self, text: &str, prepend_bos: Option<bool>) -> Result<Tensor> {
        let bos = prepend_bos.unwrap_or(self.cfg.default_prepend_bos);
        let ids = self.require_tokenizer()?.encode(text, bos)?;
        Ok(Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?)
    }

    /// Tokenize several strings into a padded batch with its mask.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] without a tokenizer or on encoding
    /// failures.
    pub fn to_tokens_batch(
        &self,
        texts: &[&str],
        prepend_bos: Option<bool>,
        padding_side: PaddingSide,
    ) -> Result<TokenBatch> {
        let bos = prepend_bos.unwrap_or(self.cfg.default_prepend_bos);
        self.require_tokenizer()?
            .encode_batch(texts, bos, padding_side, &self.device)
    }

    /// Per-token strings of `text`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] without a tokenizer or on encoding
    /// failures.
    pub fn to_str_tokens(&self, text: &str, prepend_bos: Option<bool>) -> Result<Vec<String>> {
        let tok = self.require_tokenizer()?;
        let ids = tok.encode(text, prepend_bos.unwrap_or(self.cfg.default_prepend_bos))?;
        tok.str_tokens(&ids)
    }

    /// Decode token ids into a string.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] without a tokenizer or on decoding
    /// failures.
    pub fn to_string(&self, ids: &[u32]) -> Result<String> {
        self.require_tokenizer()?.decode(ids)
    }

    /// The id of a string that is exactly one token.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Tokenizer`] if `text` is not a single token.
    pub fn to_single_token(&self, text: &str) -> Result<u32> {
        self.require_tokenizer()?.single_token(text)
    }

    // --- Weights -----------------------------------------------------------

    /// `W_E`: `[d_vocab, d_model]`.
    #[must_use]
    pub const fn w_e(&self) -> &Tensor {
        self.embed.w_e()
    }

    /// `W_pos`: `[n_ctx, d_model]`, for learned positions.
    #[must_use]
    pub fn w_pos(&self) -> Option<&Tensor> {
        self.pos_embed.as_ref().map(PosEmbed::w_pos)
    }

    /// `W_U`: `[d_model, d_vocab_out]`.
    #[must_use]
    pub const fn w_u(&self) -> &Tensor {
        self.unembed.w_u()
    }

    /// `b_U`: `[d_vocab_out]`.
    #[must_use]
    pub const fn b_u(&self) -> &Tensor {
        self.unembed.b_u()
    }
}

/// Equal-length rows into `[batch, pos]`.
fn batch_tensor(rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let width = rows.first().map_or(0, Vec::len);
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}

impl HookedWeights for HookedTransformer {
    fn attention_layers(&self) -> Vec<&Attention> {
        self.blocks.iter().map(TransformerBlock::attn).collect()
    }

    fn mlp_layers(&self) -> Vec<&Mlp> {
        self.blocks.iter().filter_map(TransformerBlock::mlp).collect()
    }

    fn layer_labels(&self) -> Vec<String> {
        (0..self.blocks.len()).map(|l| format!("L{l}")).collect()
    }
}

impl HookedRootModule for HookedTransformer {
    type Input = Tensor;

    fn hook_points(&self) -> Vec<HookPoint> {
        let mut points = vec![HookPoint::Embed];
        if self.pos_embed.is_some() {
            points.push(HookPoint::PosEmbed);
        }
        for block in &self.blocks {
            block.hook_points(&mut points);
        }
        self.ln_final.hook_points(&mut points);
        points
    }

    fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    fn cache_metadata(&self) -> CacheMetadata {
        CacheMetadata {
            n_layers: self.cfg.n_layers,
            n_heads: self.cfg.n_heads,
            d_model: self.cfg.d_model,
            normalization_type: self.cfg.normalization_type,
            attn_only: self.cfg.attn_only,
            stack: Stack::Blocks,
        }
    }

    fn run_with_spec(&self, input: &Tensor, spec: &HookSpec) -> Result<HookCache> {
        self.run(input, &ForwardOptions::default(), spec)
    }
}

impl std::fmt::Debug for HookedTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookedTransformer")
            .field("n_layers", &self.cfg.n_layers)
            .field("d_model", &self.cfg.d_model)
            .field("n_heads", &self.cfg.n_heads)
            .field("hooks", &self.registry.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tiny() -> HookedTransformer {
        HookedTransformer::random(HookedTransformerConfig::new(2, 8, 16, 4, 2, 11)).unwrap()
    }

    #[test]
    fn stop_at_layer_returns_residual() {
        let model = tiny();
        let tokens = Tensor::new(&[[1_u32, 2, 3]], &Device::Cpu).unwrap();
        let opts = ForwardOptions::default().with_stop_at_layer(1);
        let out = model.forward_with(&tokens, &opts, &HookSpec::new()).unwrap();
        assert_eq!(out.output().dims(), &[1, 3, 8]);
        let too_far = ForwardOptions::default().with_stop_at_layer(3);
        assert!(model.forward_with(&tokens, &too_far, &HookSpec::new()).is_err());
    }

    #[test]
    fn return_types() {
        let model = tiny();
        let tokens = Tensor::new(&[[1_u32, 2, 3, 4]], &Device::Cpu).unwrap();
        let both = model.forward(&tokens, ReturnType::Both).unwrap();
        assert_eq!(both.logits().unwrap().dims(), &[1, 4, 11]);
        assert_eq!(both.loss().unwrap().dims(), &[] as &[usize]);
        let per_token = model.forward(&tokens, ReturnType::PerTokenLoss).unwrap();
        assert_eq!(per_token.loss().unwrap().dims(), &[1, 3]);
        assert!(model.forward(&tokens, ReturnType::None).unwrap().logits().is_err());
    }

    #[test]
    fn context_length_is_enforced() {
        let model = tiny();
        let tokens = Tensor::zeros((1, 17), DType::U32, &Device::Cpu).unwrap();
        assert!(matches!(
            model.forward(&tokens, ReturnType::Logits),
            Err(LensError::Config(_))
        ));
    }

    #[test]
    fn greedy_generation_appends_tokens() {
        let model = tiny();
        let tokens = Tensor::new(&[[1_u32, 2]], &Device::Cpu).unwrap();
        let out = model.generate(&tokens, 3, &SamplingOptions::greedy(), None).unwrap();
        assert_eq!(out.dims(), &[1, 5]);
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let model = tiny();
        let tokens = Tensor::zeros((1, 0), DType::U32, &Device::Cpu).unwrap();
        assert!(matches!(
            model.generate(&tokens, 2, &SamplingOptions::greedy(), None),
            Err(LensError::Config(_))
        ));
    }

    fn word_tokenizer() -> LensTokenizer {
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "WhitespaceSplit" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": { "<unk>": 0, "<s>": 1, "</s>": 2, "a": 3, "b": 4 },
                "unk_token": "<unk>"
            }
        });
        let tok: tokenizers::Tokenizer = json.to_string().parse().unwrap();
        LensTokenizer::from_hf(tok, Some(1))
    }

    #[test]
    fn generate_text_stops_at_eos_not_bos() {
        let mut cfg = HookedTransformerConfig::new(1, 8, 16, 4, 2, 5);
        cfg.bos_token_id = Some(1);
        cfg.eos_token_id = Some(2);
        let mut sd = random_state_dict(&cfg, &Device::Cpu).unwrap();
        let bias = Tensor::new(&[0_f32, 0.0, 100.0, 0.0, 0.0], &Device::Cpu).unwrap();
        sd.insert("unembed.b_U".to_owned(), bias);
        let model = HookedTransformer::from_state_dict(cfg, sd)
            .unwrap()
            .with_tokenizer(word_tokenizer());

        let text = model.generate_text("a b", 5, &SamplingOptions::greedy()).unwrap();
        assert_eq!(text, "</s>");
    }

    #[test]
    fn tokenizer_helpers_need_a_tokenizer() {
        let model = tiny();
        assert!(matches!(model.to_tokens("hi", None), Err(LensError::Tokenizer(_))));
    }

    #[test]
    fn head_labels_are_layer_major() {
        let labels = tiny().all_head_labels().unwrap();
        assert_eq!(labels, vec!["L0H0", "L0H1", "L1H0", "L1H1"]);
    }
}
