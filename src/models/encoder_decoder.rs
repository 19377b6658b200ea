// SPDX-License-Identifier: MIT OR Apache-2.0

//! T5-style encoder-decoder.
//!
//! The token embedding is shared: encoder tokens pass through
//! `hook_embed`, decoder tokens enter the decoder directly at
//! `decoder.0.hook_resid_pre`.  Each stack computes its relative position
//! bias once from the table stored on its first block.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tracing::{info, warn};

use super::load_pretrained;
use super::weights::HookedWeights;
use crate::cache::CacheMetadata;
use crate::components::{
    AttnInputs, Attention, Embed, Mlp, Norm, RelativePositionBias, T5Block, Unembed,
};
use crate::config::{
    Architecture, HookedTransformerConfig, NormalizationType, PositionalEmbeddingType,
};
use crate::error::{LensError, Result};
use crate::hooks::{HookCache, HookContext, HookPoint, HookSpec, NormSite, Stack};
use crate::loading::{PretrainedOptions, StateDict, random_state_dict, validate_state_dict};
use crate::root::{HookRegistry, HookedRootModule};
use crate::tokenizer::LensTokenizer;
use crate::util::masks::{causal_mask, padding_mask};

/// Encoder-decoder inputs.
#[derive(Debug, Clone)]
pub struct Seq2SeqInput {
    /// Encoder token ids `[batch, enc_pos]`.
    pub tokens: Tensor,
    /// Decoder token ids `[batch, dec_pos]`, starting with the decoder
    /// start token.
    pub decoder_tokens: Tensor,
    /// Encoder padding mask `[batch, enc_pos]`, `1` for real tokens.
    pub attention_mask: Option<Tensor>,
}

/// One stack of T5 blocks with its shared position bias and final norm.
struct T5Stack {
    blocks: Vec<T5Block>,
    bias: RelativePositionBias,
    final_ln: Norm,
}

impl T5Stack {
    fn load(cfg: &HookedTransformerConfig, stack: Stack, vb: &VarBuilder<'_>) -> Result<Self> {
        let (prefix, site, bidirectional) = match stack {
            Stack::Encoder => ("encoder", NormSite::Final(Stack::Encoder), true),
            Stack::Decoder => ("decoder", NormSite::Final(Stack::Decoder), false),
            Stack::Blocks => {
                return Err(LensError::Config("T5 has no single block stack".into()));
            }
        };
        let blocks = (0..cfg.n_layers)
            .map(|l| T5Block::load(cfg, stack, l, vb.pp(format!("{prefix}.{l}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            blocks,
            bias: RelativePositionBias::load(cfg, bidirectional, vb.pp(format!("{prefix}.0.attn")))?,
            final_ln: Norm::load(
                cfg.normalization_type,
                cfg.d_model,
                cfg.eps,
                site,
                vb.pp(format!("{prefix}_final_ln")),
            )?,
        })
    }

    fn hook_points(&self, out: &mut Vec<HookPoint>) {
        for block in &self.blocks {
            block.hook_points(out);
        }
        self.final_ln.hook_points(out);
    }
}

/// Sequence-to-sequence model with self attention in both stacks and
/// cross attention in the decoder.
pub struct HookedEncoderDecoder {
    cfg: HookedTransformerConfig,
    embed: Embed,
    encoder: T5Stack,
    decoder: T5Stack,
    unembed: Unembed,
    registry: HookRegistry,
    tokenizer: Option<LensTokenizer>,
    device: Device,
}

impl HookedEncoderDecoder {
    /// Build the model from parameters with instrumented names.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for an invalid config and
    /// [`LensError::Model`] on a missing or misshapen parameter.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(cfg: HookedTransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        cfg.validate()?;
        warn!("HookedEncoderDecoder support is experimental");
        let model = Self {
            embed: Embed::load(&cfg, vb.pp("embed"))?,
            encoder: T5Stack::load(&cfg, Stack::Encoder, &vb)?,
            decoder: T5Stack::load(&cfg, Stack::Decoder, &vb)?,
            unembed: Unembed::load(&cfg, vb.pp("unembed"))?,
            registry: HookRegistry::new(),
            tokenizer: None,
            device: vb.device().clone(),
            cfg,
        };
        info!(
            layers = model.cfg.n_layers,
            d_model = model.cfg.d_model,
            "built HookedEncoderDecoder"
        );
        Ok(model)
    }

    /// Build the model from a state dict on `cfg.device` in `cfg.dtype`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::MissingWeight`] or [`LensError::ShapeMismatch`]
    /// if the state dict does not match the config.
    pub fn from_state_dict(cfg: HookedTransformerConfig, state_dict: StateDict) -> Result<Self> {
        validate_state_dict(&cfg, &state_dict)?;
        let device = cfg.device.resolve()?;
        let vb = VarBuilder::from_tensors(state_dict, cfg.dtype.dtype(), &device);
        Self::new(cfg, vb)
    }

    /// An untrained model with random parameters and T5 wiring (RMS
    /// norms, relative position bias, unscaled attention).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for an invalid config.
    pub fn random(mut cfg: HookedTransformerConfig) -> Result<Self> {
        cfg.original_architecture = Some(Architecture::T5);
        cfg.normalization_type = NormalizationType::RmsNorm;
        cfg.positional_embedding_type = PositionalEmbeddingType::Relative;
        cfg.use_attn_scale = false;
        cfg.validate()?;
        let state_dict = random_state_dict(&cfg, &cfg.device.resolve()?)?;
        Self::from_state_dict(cfg, state_dict)
    }

    /// Load a T5 checkpoint by name or local directory.
    ///
    /// Weight processing options are ignored for encoder-decoders.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for non-T5 checkpoints and loader
    /// errors.
    pub fn from_pretrained(name: &str, opts: &PretrainedOptions) -> Result<Self> {
        let pretrained = load_pretrained(
            name,
            opts,
            |cfg| cfg.original_architecture == Some(Architecture::T5),
            "HookedTransformer or HookedEncoder",
        )?;
        let mut model = Self::from_state_dict(pretrained.cfg, pretrained.state_dict)?;
        if let Some(path) = pretrained.tokenizer {
            model.tokenizer = Some(LensTokenizer::from_file(path, None)?);
        }
        Ok(model)
    }

    /// The model configuration.
    #[must_use]
    pub const fn cfg(&self) -> &HookedTransformerConfig {
        &self.cfg
    }

    /// The attached tokenizer, if any.
    #[must_use]
    pub const fn tokenizer(&self) -> Option<&LensTokenizer> {
        self.tokenizer.as_ref()
    }

    /// Attach a tokenizer.
    #[must_use]
    pub fn with_tokenizer(mut self, tokenizer: LensTokenizer) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Decoder logits `[batch, dec_pos, d_vocab_out]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    pub fn forward(&self, input: &Seq2SeqInput) -> Result<Tensor> {
        Ok(self.run(input, &HookSpec::new())?.into_output())
    }

    fn run(&self, input: &Seq2SeqInput, spec: &HookSpec) -> Result<HookCache> {
        let tokens = input.tokens.to_device(&self.device)?;
        let decoder_tokens = input.decoder_tokens.to_device(&self.device)?;
        let (_, enc_len) = tokens.dims2()?;
        let (_, dec_len) = decoder_tokens.dims2()?;
        let mut ctx = HookContext::new(self.registry.snapshot(), spec);

        // --- Encoder ---
        let enc_mask = input
            .attention_mask
            .as_ref()
            .map(|m| padding_mask(&m.to_device(&self.device)?, DType::F32))
            .transpose()?;
        let enc_bias = self.encoder.bias.forward(enc_len, enc_len)?;
        let enc_inputs = AttnInputs {
            mask: enc_mask.as_ref(),
            has_padding: enc_mask.is_some(),
            rope: None,
            position_bias: Some(&enc_bias),
        };
        let embedded = self.embed.forward(&tokens, &mut ctx)?;
        let mut resid = ctx.apply(HookPoint::FullEmbed, embedded)?;
        for block in &self.encoder.blocks {
            resid = block.forward(resid, enc_inputs, None, &mut ctx)?;
        }
        let encoded = self.encoder.final_ln.forward(&resid, &mut ctx)?;

        // --- Decoder ---
        let dec_mask = causal_mask(dec_len, &self.device, DType::F32)?;
        let dec_bias = self.decoder.bias.forward(dec_len, dec_len)?;
        let dec_inputs = AttnInputs {
            mask: Some(&dec_mask),
            has_padding: false,
            rope: None,
            position_bias: Some(&dec_bias),
        };
        let cross_inputs = AttnInputs {
            mask: enc_mask.as_ref(),
            has_padding: enc_mask.is_some(),
            rope: None,
            position_bias: None,
        };
        let mut resid = self.embed.embed_tokens(&decoder_tokens)?;
        for block in &self.decoder.blocks {
            resid = block.forward(resid, dec_inputs, Some((&encoded, cross_inputs)), &mut ctx)?;
        }
        let normalized = self.decoder.final_ln.forward(&resid, &mut ctx)?;
        let logits = self.unembed.forward(&normalized)?;
        Ok(ctx.finish(logits))
    }

    /// `W_E` shared by both stacks: `[d_vocab, d_model]`.
    #[must_use]
    pub const fn w_e(&self) -> &Tensor {
        self.embed.w_e()
    }

    /// `W_U`: `[d_model, d_vocab_out]`.
    #[must_use]
    pub const fn w_u(&self) -> &Tensor {
        self.unembed.w_u()
    }

    /// Cross-attention layers of the decoder, in order.
    #[must_use]
    pub fn cross_attention_layers(&self) -> Vec<&Attention> {
        self.decoder
            .blocks
            .iter()
            .filter_map(T5Block::cross_attn)
            .collect()
    }
}

impl HookedWeights for HookedEncoderDecoder {
    fn attention_layers(&self) -> Vec<&Attention> {
        self.encoder
            .blocks
            .iter()
            .chain(&self.decoder.blocks)
            .map(T5Block::attn)
            .collect()
    }

    fn mlp_layers(&self) -> Vec<&Mlp> {
        self.encoder
            .blocks
            .iter()
            .chain(&self.decoder.blocks)
            .map(T5Block::mlp)
            .collect()
    }

    fn layer_labels(&self) -> Vec<String> {
        let n = self.cfg.n_layers;
        (0..n)
            .map(|l| format!("EL{l}"))
            .chain((0..n).map(|l| format!("DL{l}")))
            .collect()
    }
}

impl HookedRootModule for HookedEncoderDecoder {
    type Input = Seq2SeqInput;

    fn hook_points(&self) -> Vec<HookPoint> {
        let mut points = vec![HookPoint::Embed, HookPoint::FullEmbed];
        self.encoder.hook_points(&mut points);
        self.decoder.hook_points(&mut points);
        points
    }

    fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    /// Layer accessors of the resulting cache address the decoder; call
    /// [`ActivationCache::select_stack`](crate::ActivationCache::select_stack)
    /// for the encoder.
    fn cache_metadata(&self) -> CacheMetadata {
        CacheMetadata {
            n_layers: self.cfg.n_layers,
            n_heads: self.cfg.n_heads,
            d_model: self.cfg.d_model,
            normalization_type: self.cfg.normalization_type,
            attn_only: false,
            stack: Stack::Decoder,
        }
    }

    fn run_with_spec(&self, input: &Seq2SeqInput, spec: &HookSpec) -> Result<HookCache> {
        self.run(input, spec)
    }
}

impl std::fmt::Debug for HookedEncoderDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookedEncoderDecoder")
            .field("n_layers", &self.cfg.n_layers)
            .field("d_model", &self.cfg.d_model)
            .field("hooks", &self.registry.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::hooks::{AttnHook, AttnSite, HookFilter, Layer};

    fn tiny() -> HookedEncoderDecoder {
        let mut cfg = HookedTransformerConfig::new(2, 8, 16, 4, 2, 17);
        cfg.act_fn = crate::config::ActivationFunction::Relu;
        cfg.relative_attention_num_buckets = 8;
        cfg.relative_attention_max_distance = 16;
        HookedEncoderDecoder::random(cfg).unwrap()
    }

    fn input() -> Seq2SeqInput {
        Seq2SeqInput {
            tokens: Tensor::new(&[[3_u32, 4, 5, 6]], &Device::Cpu).unwrap(),
            decoder_tokens: Tensor::new(&[[0_u32, 7]], &Device::Cpu).unwrap(),
            attention_mask: None,
        }
    }

    #[test]
    fn logits_follow_the_decoder() {
        assert_eq!(tiny().forward(&input()).unwrap().dims(), &[1, 2, 17]);
    }

    #[test]
    fn cross_attention_pattern_spans_the_encoder() {
        let model = tiny();
        let point = HookPoint::Attn(Layer::decoder(1), AttnSite::CrossAttn, AttnHook::Pattern);
        let (_, cache) = model.run_with_cache(&input(), point.clone()).unwrap();
        assert_eq!(cache.require(&point).unwrap().dims(), &[1, 2, 2, 4]);
    }

    #[test]
    fn every_hook_point_is_captured() {
        let model = tiny();
        let (_, cache) = model.run_with_cache(&input(), HookFilter::All).unwrap();
        for point in model.hook_points() {
            assert!(cache.contains(&point), "missing {point}");
        }
    }

    #[test]
    fn full_embed_feeds_the_encoder() {
        let model = tiny();
        let (_, cache) = model.run_with_cache(&input(), HookFilter::All).unwrap();
        let embed = cache.require(&HookPoint::Embed).unwrap();
        let full = cache.require(&HookPoint::FullEmbed).unwrap();
        let diff: f32 = (embed - full).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-6);

        let clean = model.forward(&input()).unwrap();
        let zeroed = model
            .run_with_hooks(
                &input(),
                vec![(
                    HookPoint::FullEmbed.into(),
                    crate::hooks::Hook::Intervene(crate::hooks::Intervention::Zero),
                )],
            )
            .unwrap();
        let moved: f32 =
            (clean - zeroed).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(moved > 1e-4);
    }

    #[test]
    fn labels_cover_both_stacks() {
        let labels = tiny().all_head_labels().unwrap();
        assert_eq!(labels.len(), 8);
        assert_eq!(labels[0], "EL0H0");
        assert_eq!(labels[4], "DL0H0");
    }

    #[test]
    fn circuits_stack_both_stacks() {
        assert_eq!(tiny().ov().unwrap().shape(), vec![4, 2, 8, 8]);
    }
}
