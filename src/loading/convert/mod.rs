// SPDX-License-Identifier: MIT OR Apache-2.0

//! Checkpoint conversion into instrumented parameter names.
//!
//! Each family module renames and reshapes the tensors of one checkpoint
//! layout.  Parameters a family does not have (LLaMA attention biases,
//! T5 MLP biases, ...) are filled with zeros so every model sees the same
//! parameter set.

mod bert;
mod gpt2;
mod llama;
mod neox;
mod t5;

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

use super::state_dict::StateDict;
use crate::config::{Architecture, HookedTransformerConfig};
use crate::error::{LensError, Result};

/// Convert raw checkpoint tensors into an instrumented state dict (`F32`).
///
/// The layout is chosen by `cfg.original_architecture`.
///
/// # Errors
///
/// Returns [`LensError::Config`] without an original architecture,
/// [`LensError::MissingWeight`] when the checkpoint lacks a tensor, and
/// [`LensError::Model`] on reshape failures.
pub fn convert_state_dict(
    cfg: &HookedTransformerConfig,
    raw: HashMap<String, Tensor>,
) -> Result<StateDict> {
    let arch = cfg.original_architecture.ok_or_else(|| {
        LensError::Config("cannot convert a checkpoint without original_architecture".into())
    })?;
    let total = raw.len();
    let device = raw
        .values()
        .next()
        .map_or(Device::Cpu, |t| t.device().clone());
    let mut src = Source::new(raw, prefixes(arch));
    let mut out = Converted::new(cfg, device);
    match arch {
        Architecture::Gpt2 => gpt2::convert(cfg, &mut src, &mut out)?,
        Architecture::GptNeoX => neox::convert(cfg, &mut src, &mut out)?,
        Architecture::Llama | Architecture::Mistral | Architecture::Qwen2 => {
            llama::convert(cfg, &mut src, &mut out)?;
        }
        Architecture::Bert => bert::convert(cfg, &mut src, &mut out)?,
        Architecture::T5 => t5::convert(cfg, &mut src, &mut out)?,
    }
    info!(
        architecture = %arch,
        source_tensors = total,
        parameters = out.dict.len(),
        "checkpoint converted"
    );
    if !src.remaining().is_empty() {
        debug!(unused = ?src.remaining(), "checkpoint tensors not used by the conversion");
    }
    Ok(out.dict)
}

/// Name prefixes a family's checkpoints may carry.
const fn prefixes(arch: Architecture) -> &'static [&'static str] {
    match arch {
        Architecture::Gpt2 => &["transformer."],
        Architecture::GptNeoX => &["gpt_neox."],
        Architecture::Llama | Architecture::Mistral | Architecture::Qwen2 => &["model."],
        Architecture::Bert => &["bert."],
        Architecture::T5 => &[],
    }
}

// ---------------------------------------------------------------------------
// Source: raw checkpoint tensors
// ---------------------------------------------------------------------------

/// Raw checkpoint tensors, consumed by name.
struct Source {
    tensors: HashMap<String, Tensor>,
    prefixes: &'static [&'static str],
}

impl Source {
    const fn new(tensors: HashMap<String, Tensor>, prefixes: &'static [&'static str]) -> Self {
        Self { tensors, prefixes }
    }

    /// Remove `name` (with or without a family prefix), as `F32`.
    fn take_opt(&mut self, name: &str) -> Result<Option<Tensor>> {
        let prefixes = self.prefixes;
        let found = prefixes
            .iter()
            .map(|p| format!("{p}{name}"))
            .chain(std::iter::once(name.to_owned()))
            .find_map(|key| self.tensors.remove(&key));
        match found {
            Some(t) => Ok(Some(t.to_dtype(DType::F32)?)),
            None => Ok(None),
        }
    }

    fn take(&mut self, name: &str) -> Result<Tensor> {
        self.take_opt(name)?
            .ok_or_else(|| LensError::MissingWeight(name.to_owned()))
    }

    /// First of several alternative names (e.g. `weight` / `gamma`).
    fn take_any(&mut self, names: &[&str]) -> Result<Tensor> {
        for name in names {
            if let Some(t) = self.take_opt(name)? {
                return Ok(t);
            }
        }
        Err(LensError::MissingWeight(names.join(" | ")))
    }

    fn remaining(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ---------------------------------------------------------------------------
// Converted: the instrumented state dict under construction
// ---------------------------------------------------------------------------

struct Converted {
    dict: StateDict,
    n_heads: usize,
    d_head: usize,
    device: Device,
}

impl Converted {
    fn new(cfg: &HookedTransformerConfig, device: Device) -> Self {
        Self {
            dict: StateDict::new(),
            n_heads: cfg.n_heads,
            d_head: cfg.d_head,
            device,
        }
    }

    fn put(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.dict.insert(name.into(), tensor);
    }

    fn zeros(&mut self, name: impl Into<String>, shape: &[usize]) -> Result<()> {
        let t = Tensor::zeros(shape, DType::F32, &self.device)?;
        self.put(name, t);
        Ok(())
    }

    /// Store a `torch.nn.Linear` weight `[out, in]` as `[in, out]`.
    fn put_t(&mut self, name: impl Into<String>, linear: &Tensor) -> Result<()> {
        let t = linear.t()?.contiguous()?;
        self.put(name, t);
        Ok(())
    }

    /// `{prefix}.w` and `{prefix}.b` of a layer norm.
    fn put_norm(&mut self, prefix: &str, w: Tensor, b: Option<Tensor>) {
        self.put(format!("{prefix}.w"), w);
        if let Some(b) = b {
            self.put(format!("{prefix}.b"), b);
        }
    }

    /// Linear projection `[heads * d_head, d_model]` → `[heads, d_model, d_head]`.
    fn put_in_heads(&mut self, name: impl Into<String>, linear: &Tensor, heads: usize) -> Result<()> {
        let m = linear.dim(1)?;
        let t = linear
            .reshape((heads, self.d_head, m))?
            .transpose(1, 2)?
            .contiguous()?;
        self.put(name, t);
        Ok(())
    }

    /// Bias `[heads * d_head]` → `[heads, d_head]`, zeros when absent.
    fn put_head_bias(&mut self, name: impl Into<String>, bias: Option<Tensor>, heads: usize) -> Result<()> {
        let d = self.d_head;
        match bias {
            Some(b) => {
                let t = b.reshape((heads, d))?;
                self.put(name, t);
                Ok(())
            }
            None => self.zeros(name, &[heads, d]),
        }
    }

    /// Output projection `[d_model, n_heads * d_head]` → `[n_heads, d_head, d_model]`.
    fn put_out_heads(&mut self, name: impl Into<String>, linear: &Tensor) -> Result<()> {
        let m = linear.dim(0)?;
        let t = linear
            .t()?
            .reshape((self.n_heads, self.d_head, m))?
            .contiguous()?;
        self.put(name, t);
        Ok(())
    }
}
