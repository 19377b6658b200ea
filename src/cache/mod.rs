// SPDX-License-Identifier: MIT OR Apache-2.0

//! Recorded activations of one forward pass.
//!
//! - [`ActivationCache`]: every captured tensor keyed by [`HookPoint`](crate::HookPoint),
//!   with residual-stream decompositions and per-head attributions.
//! - [`Slice`]: position selector used by the stacking accessors.

mod activation;
mod slice;

pub use activation::{ActivationCache, CacheMetadata, DecomposeMode};
pub use slice::Slice;
