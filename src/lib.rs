// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-lens
//!
//! Hooked transformers for mechanistic interpretability, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! Every intermediate activation of the forward pass flows through a named
//! hook point (`blocks.3.attn.hook_pattern`, `ln_final.hook_scale`, ...)
//! using the `TransformerLens` naming.  Hook points can be cached,
//! observed, or replaced, either for one call or persistently.
//!
//! ## Models
//!
//! - [`HookedTransformer`]: decoder-only models (GPT-2, GPT-NeoX/Pythia,
//!   `LLaMA`, Mistral, Qwen2).
//! - [`HookedEncoder`]: BERT masked-LM encoders (experimental).
//! - [`HookedEncoderDecoder`]: T5 sequence-to-sequence models
//!   (experimental).
//!
//! ## Quick start
//!
//! ```no_run
//! use candle_lens::{HookPoint, HookedRootModule, HookedTransformer, PretrainedOptions};
//!
//! # fn main() -> candle_lens::Result<()> {
//! let model = HookedTransformer::from_pretrained("gpt2-small", &PretrainedOptions::default())?;
//! let tokens = model.to_tokens("The cat sat on the", None)?;
//! let (logits, cache) = model.run_with_cache(&tokens, "blocks.*.attn.hook_pattern")?;
//! let pattern = cache.require(&HookPoint::pattern(0))?;
//! println!("{:?} {:?}", logits.dims(), pattern.dims());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod components;
pub mod config;
pub mod error;
pub mod factored;
pub mod hooks;
pub mod loading;
pub mod models;
pub mod root;
pub mod tokenizer;
pub mod util;

pub use cache::{ActivationCache, CacheMetadata, DecomposeMode, Slice};
pub use config::{
    ActivationFunction, Architecture, DeviceSpec, HookedTransformerConfig, NormalizationType,
    PositionalEmbeddingType, Precision, RopeScaling,
};
pub use error::{LensError, Result};
pub use factored::{FactoredMatrix, Product};
pub use hooks::{
    AttnHook, AttnSite, Hook, HookCache, HookFilter, HookPoint, HookSpec, Intervention, Layer,
    NormSite, Stack,
};
pub use loading::{PretrainedOptions, get_official_model_name, official_model_names};
pub use models::{
    EncoderInput, ForwardOptions, ForwardOutput, HookedEncoder, HookedEncoderDecoder,
    HookedTransformer, HookedWeights, ReturnType, Seq2SeqInput,
};
pub use root::{HookGuard, HookHandle, HookLifetime, HookRegistry, HookedRootModule};
pub use tokenizer::{LensTokenizer, PaddingSide, TokenBatch};
pub use util::sampling::SamplingOptions;
