// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared utilities: attention masks, next-token loss and sampling.

pub mod loss;
pub mod masks;
pub mod sampling;
