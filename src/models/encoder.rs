// SPDX-License-Identifier: MIT OR Apache-2.0

//! BERT-style masked-LM encoder.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tracing::{info, warn};

use super::load_pretrained;
use super::weights::HookedWeights;
use crate::cache::CacheMetadata;
use crate::components::{
    AttnInputs, Attention, BertBlock, Embed, Mlp, MlmHead, Norm, PosEmbed, TokenTypeEmbed,
    Unembed,
};
use crate::config::{Architecture, HookedTransformerConfig, NormalizationType};
use crate::error::{LensError, Result};
use crate::hooks::{HookCache, HookContext, HookPoint, HookSpec, NormSite, Stack};
use crate::loading::{PretrainedOptions, StateDict, random_state_dict, validate_state_dict};
use crate::root::{HookRegistry, HookedRootModule};
use crate::tokenizer::LensTokenizer;
use crate::util::masks::padding_mask;

/// Encoder inputs: token ids plus optional segment ids and padding mask,
/// all `[batch, pos]`.
#[derive(Debug, Clone)]
pub struct EncoderInput {
    /// Token ids.
    pub tokens: Tensor,
    /// Segment ids (`0` or `1`); all zeros when absent.
    pub token_type_ids: Option<Tensor>,
    /// `1` for real tokens, `0` for padding.
    pub attention_mask: Option<Tensor>,
}

impl From<Tensor> for EncoderInput {
    fn from(tokens: Tensor) -> Self {
        Self {
            tokens,
            token_type_ids: None,
            attention_mask: None,
        }
    }
}

/// Bidirectional post-norm encoder with a masked-LM head.
pub struct HookedEncoder {
    cfg: HookedTransformerConfig,
    embed: Embed,
    pos_embed: PosEmbed,
    token_type_embed: TokenTypeEmbed,
    embed_ln: Norm,
    blocks: Vec<BertBlock>,
    mlm_head: MlmHead,
    unembed: Unembed,
    registry: HookRegistry,
    tokenizer: Option<LensTokenizer>,
    device: Device,
}

impl HookedEncoder {
    /// Build the encoder from parameters with instrumented names.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for an invalid config and
    /// [`LensError::Model`] on a missing or misshapen parameter.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(cfg: HookedTransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        cfg.validate()?;
        warn!("HookedEncoder support is experimental");
        let blocks = (0..cfg.n_layers)
            .map(|l| BertBlock::load(&cfg, l, vb.pp(format!("blocks.{l}"))))
            .collect::<Result<Vec<_>>>()?;
        let embed_ln = Norm::load(
            NormalizationType::LayerNorm,
            cfg.d_model,
            cfg.eps,
            NormSite::EmbedLn,
            vb.pp("embed_ln"),
        )?;
        info!(layers = cfg.n_layers, d_model = cfg.d_model, "built HookedEncoder");
        Ok(Self {
            embed: Embed::load(&cfg, vb.pp("embed"))?,
            pos_embed: PosEmbed::load(&cfg, vb.pp("pos_embed"))?,
            token_type_embed: TokenTypeEmbed::load(&cfg, vb.pp("token_type_embed"))?,
            embed_ln,
            blocks,
            mlm_head: MlmHead::load(&cfg, vb.pp("mlm_head"))?,
            unembed: Unembed::load(&cfg, vb.pp("unembed"))?,
            registry: HookRegistry::new(),
            tokenizer: None,
            device: vb.device().clone(),
            cfg,
        })
    }

    /// Build the encoder from a state dict on `cfg.device` in `cfg.dtype`.
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

    /// An untrained encoder with random parameters.
    ///
    /// `cfg.original_architecture` is set to BERT so the parameter set
    /// includes the encoder-only tensors.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for an invalid config.
    pub fn random(mut cfg: HookedTransformerConfig) -> Result<Self> {
        cfg.original_architecture = Some(Architecture::Bert);
        cfg.normalization_type = NormalizationType::LayerNorm;
        cfg.validate()?;
        let state_dict = random_state_dict(&cfg, &cfg.device.resolve()?)?;
        Self::from_state_dict(cfg, state_dict)
    }

    /// Load a BERT checkpoint by name or local directory.
    ///
    /// Weight processing options are ignored for encoders.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for non-BERT checkpoints and loader
    /// errors.
    pub fn from_pretrained(name: &str, opts: &PretrainedOptions) -> Result<Self> {
        let pretrained = load_pretrained(
            name,
            opts,
            |cfg| cfg.original_architecture == Some(Architecture::Bert),
            "HookedTransformer or HookedEncoderDecoder",
        )?;
        let bos = pretrained.cfg.bos_token_id;
        let mut model = Self::from_state_dict(pretrained.cfg, pretrained.state_dict)?;
        if let Some(path) = pretrained.tokenizer {
            model.tokenizer = Some(LensTokenizer::from_file(path, bos)?);
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

    /// Masked-LM logits `[batch, pos, d_vocab_out]`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] on tensor failures.
    pub fn forward(&self, input: &EncoderInput) -> Result<Tensor> {
        Ok(self.run(input, &HookSpec::new())?.into_output())
    }

    fn run(&self, input: &EncoderInput, spec: &HookSpec) -> Result<HookCache> {
        let (_, seq_len) = input.tokens.dims2()?;
        if seq_len > self.cfg.n_ctx {
            return Err(LensError::Config(format!(
                "sequence of {seq_len} tokens exceeds n_ctx = {}",
                self.cfg.n_ctx
            )));
        }
        let tokens = input.tokens.to_device(&self.device)?;
        let token_types = input
            .token_type_ids
            .as_ref()
            .map(|t| t.to_device(&self.device))
            .transpose()?;
        let mut ctx = HookContext::new(self.registry.snapshot(), spec);

        let embed = self.embed.forward(&tokens, &mut ctx)?;
        let pos = self.pos_embed.forward(&tokens, None, &mut ctx)?;
        let token_type = self
            .token_type_embed
            .forward(&tokens, token_types.as_ref(), &mut ctx)?;
        let summed = ((embed + pos)? + token_type)?;
        let normalized = self.embed_ln.forward(&summed, &mut ctx)?;
        let mut resid = ctx.apply(HookPoint::FullEmbed, normalized)?;

        let mask = input
            .attention_mask
            .as_ref()
            .map(|m| padding_mask(&m.to_device(&self.device)?, DType::F32))
            .transpose()?;
        let inputs = AttnInputs {
            mask: mask.as_ref(),
            has_padding: mask.is_some(),
            rope: None,
            position_bias: None,
        };
        for block in &self.blocks {
            resid = block.forward(resid, inputs, &mut ctx)?;
        }
        let head = self.mlm_head.forward(&resid, &mut ctx)?;
        let logits = self.unembed.forward(&head)?;
        Ok(ctx.finish(logits))
    }

    /// `W_E`: `[d_vocab, d_model]`.
    #[must_use]
    pub const fn w_e(&self) -> &Tensor {
        self.embed.w_e()
    }

    /// `W_pos`: `[n_ctx, d_model]`.
    #[must_use]
    pub const fn w_pos(&self) -> &Tensor {
        self.pos_embed.w_pos()
    }

    /// `W_U`: `[d_model, d_vocab_out]`.
    #[must_use]
    pub const fn w_u(&self) -> &Tensor {
        self.unembed.w_u()
    }
}

impl HookedWeights for HookedEncoder {
    fn attention_layers(&self) -> Vec<&Attention> {
        self.blocks.iter().map(BertBlock::attn).collect()
    }

    fn mlp_layers(&self) -> Vec<&Mlp> {
        self.blocks.iter().map(BertBlock::mlp).collect()
    }

    fn layer_labels(&self) -> Vec<String> {
        (0..self.blocks.len()).map(|l| format!("L{l}")).collect()
    }
}

impl HookedRootModule for HookedEncoder {
    type Input = EncoderInput;

    fn hook_points(&self) -> Vec<HookPoint> {
        let mut points = vec![HookPoint::Embed, HookPoint::PosEmbed, HookPoint::TokenTypeEmbed];
        self.embed_ln.hook_points(&mut points);
        points.push(HookPoint::FullEmbed);
        for block in &self.blocks {
            block.hook_points(&mut points);
        }
        self.mlm_head.hook_points(&mut points);
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
            normalization_type: NormalizationType::LayerNorm,
            attn_only: false,
            stack: Stack::Blocks,
        }
    }

    fn run_with_spec(&self, input: &EncoderInput, spec: &HookSpec) -> Result<HookCache> {
        self.run(input, spec)
    }
}

impl std::fmt::Debug for HookedEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookedEncoder")
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

    fn tiny() -> HookedEncoder {
        let mut cfg = HookedTransformerConfig::new(2, 8, 16, 4, 2, 13);
        cfg.act_fn = crate::config::ActivationFunction::Gelu;
        HookedEncoder::random(cfg).unwrap()
    }

    #[test]
    fn mlm_logits_shape() {
        let model = tiny();
        let tokens = Tensor::new(&[[1_u32, 2, 3], [4, 5, 0]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1_u32, 1, 1], [1, 1, 0]], &Device::Cpu).unwrap();
        let input = EncoderInput {
            tokens,
            token_type_ids: None,
            attention_mask: Some(mask),
        };
        assert_eq!(model.forward(&input).unwrap().dims(), &[2, 3, 13]);
    }

    #[test]
    fn padding_does_not_change_real_positions() {
        let model = tiny();
        let short = EncoderInput::from(Tensor::new(&[[1_u32, 2]], &Device::Cpu).unwrap());
        let padded = EncoderInput {
            tokens: Tensor::new(&[[1_u32, 2, 0]], &Device::Cpu).unwrap(),
            token_type_ids: None,
            attention_mask: Some(Tensor::new(&[[1_u32, 1, 0]], &Device::Cpu).unwrap()),
        };
        let a = model.forward(&short).unwrap();
        let b = model.forward(&padded).unwrap().narrow(1, 0, 2).unwrap();
        let diff: f32 = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4);
    }

    #[test]
    fn every_hook_point_is_captured() {
        let model = tiny();
        let input = EncoderInput::from(Tensor::new(&[[1_u32, 2]], &Device::Cpu).unwrap());
        let (_, cache) = model
            .run_with_cache(&input, crate::hooks::HookFilter::All)
            .unwrap();
        for point in model.hook_points() {
            assert!(cache.contains(&point), "missing {point}");
        }
    }
}
