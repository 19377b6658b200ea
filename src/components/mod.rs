// SPDX-License-Identifier: MIT OR Apache-2.0

//! Architecture building blocks shared by the hooked models.
//!
//! Every component loads its parameters from a [`VarBuilder`](candle_nn::VarBuilder)
//! using the instrumented names (`W_E`, `W_Q`, `b_O`, `W_in`, ...) and
//! routes its intermediate activations through a
//! [`HookContext`](crate::hooks::HookContext).

pub mod attention;
pub mod blocks;
pub mod embed;
pub mod mlp;
pub mod norm;
pub mod rope;

pub use attention::{AttnInputs, Attention, RelativePositionBias, relative_position_bucket};
pub use blocks::{BertBlock, T5Block, TransformerBlock};
pub use embed::{Embed, MlmHead, PosEmbed, TokenTypeEmbed, Unembed};
pub use mlp::{Mlp, activate};
pub use norm::Norm;
pub use rope::RopeCache;
