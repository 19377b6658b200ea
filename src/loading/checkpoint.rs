// SPDX-License-Identifier: MIT OR Apache-2.0

//! Checkpoint resolution and safetensors reading.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use tracing::info;

use super::get_official_model_name;
use crate::error::{LensError, Result};

/// Files of one checkpoint on local disk.
#[derive(Debug, Clone)]
pub struct CheckpointFiles {
    /// Repository name, or the directory for local checkpoints.
    pub name: String,
    /// `config.json`.
    pub config: PathBuf,
    /// Safetensors files (several for sharded checkpoints).
    pub weights: Vec<PathBuf>,
    /// `tokenizer.json`, if the checkpoint ships one.
    pub tokenizer: Option<PathBuf>,
}

impl CheckpointFiles {
    /// Parse `config.json`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Io`] if the file cannot be read and
    /// [`LensError::Config`] if it is not valid JSON.
    pub fn read_config(&self) -> Result<serde_json::Value> {
        let text = std::fs::read_to_string(&self.config)?;
        serde_json::from_str(&text)
            .map_err(|e| LensError::Config(format!("parse {}: {e}", self.config.display())))
    }
}

/// Sharded checkpoint index (`model.safetensors.index.json`).
#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    /// Maps weight name → shard filename.
    weight_map: HashMap<String, String>,
}

impl SafetensorsIndex {
    fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| LensError::Config(format!("parse {}: {e}", path.display())))
    }

    /// Unique shard file names, sorted.
    fn shards(&self) -> Vec<String> {
        let mut names: Vec<String> = self.weight_map.values().cloned().collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Locate a checkpoint.
///
/// An existing directory containing `config.json` is used as is.  Anything
/// else is treated as a checkpoint name: it is resolved through the
/// official-name table and fetched with `hf-hub` (files already in the
/// `HuggingFace` cache are not downloaded again).
///
/// # Errors
///
/// Returns [`LensError::UnknownCheckpoint`] for unknown names,
/// [`LensError::Download`] on hub failures, and [`LensError::MissingWeight`]
/// if no safetensors file is present.
pub fn resolve_checkpoint(name_or_path: &str, revision: &str) -> Result<CheckpointFiles> {
    let dir = Path::new(name_or_path);
    if dir.join("config.json").is_file() {
        info!(path = %dir.display(), "using local checkpoint");
        return local_checkpoint(dir);
    }
    let official = get_official_model_name(name_or_path)?;
    info!(name = official, revision, "resolving checkpoint on the hub");
    hub_checkpoint(official, revision)
}

fn local_checkpoint(dir: &Path) -> Result<CheckpointFiles> {
    let index = dir.join("model.safetensors.index.json");
    let weights = if index.is_file() {
        SafetensorsIndex::read(&index)?
            .shards()
            .into_iter()
            .map(|shard| dir.join(shard))
            .collect()
    } else {
        let single = dir.join("model.safetensors");
        if !single.is_file() {
            return Err(LensError::MissingWeight(format!(
                "no model.safetensors in {}",
                dir.display()
            )));
        }
        vec![single]
    };
    let tokenizer = Some(dir.join("tokenizer.json")).filter(|p| p.is_file());
    Ok(CheckpointFiles {
        name: dir.display().to_string(),
        config: dir.join("config.json"),
        weights,
        tokenizer,
    })
}

fn hub_checkpoint(repo_id: &str, revision: &str) -> Result<CheckpointFiles> {
    let api = Api::new().map_err(|e| LensError::Download(format!("hub client: {e}")))?;
    let repo = api.repo(Repo::with_revision(
        repo_id.to_owned(),
        RepoType::Model,
        revision.to_owned(),
    ));
    let fetch = |repo: &ApiRepo, file: &str| {
        repo.get(file)
            .map_err(|e| LensError::Download(format!("{repo_id}/{file}: {e}")))
    };

    let config = fetch(&repo, "config.json")?;
    let weights = if let Ok(index) = repo.get("model.safetensors.index.json") {
        SafetensorsIndex::read(&index)?
            .shards()
            .iter()
            .map(|shard| fetch(&repo, shard))
            .collect::<Result<Vec<_>>>()?
    } else {
        vec![fetch(&repo, "model.safetensors").map_err(|e| {
            LensError::MissingWeight(format!("{repo_id} has no usable safetensors file ({e})"))
        })?]
    };
    let tokenizer = repo.get("tokenizer.json").ok();
    info!(repo = repo_id, shards = weights.len(), "checkpoint resolved");
    Ok(CheckpointFiles {
        name: repo_id.to_owned(),
        config,
        weights,
        tokenizer,
    })
}

/// Read every tensor of the given safetensors files onto `device`.
///
/// Tensors keep their stored dtype.  Sharded checkpoints need the `mmap`
/// feature.
///
/// # Errors
///
/// Returns [`LensError::Config`] for sharded checkpoints without `mmap`,
/// [`LensError::Io`] on read failures and [`LensError::Model`] on malformed
/// files.
pub fn load_safetensors(paths: &[PathBuf], device: &Device) -> Result<HashMap<String, Tensor>> {
    #[cfg(feature = "mmap")]
    {
        mmap_load(paths, device)
    }
    #[cfg(not(feature = "mmap"))]
    {
        buffered_load(paths, device)
    }
}

/// Read a single file into RAM.
#[cfg(not(feature = "mmap"))]
fn buffered_load(paths: &[PathBuf], device: &Device) -> Result<HashMap<String, Tensor>> {
    if paths.len() > 1 {
        return Err(LensError::Config(
            "sharded checkpoints require the `mmap` feature: \
             candle-lens = { features = [\"mmap\"] }"
                .into(),
        ));
    }
    let path = paths
        .first()
        .ok_or_else(|| LensError::MissingWeight("no safetensors files".into()))?;
    let data = std::fs::read(path)?;
    Ok(candle_core::safetensors::load_buffer(&data, device)?)
}

/// Memory-map every shard.
///
/// # Safety
///
/// The safetensors files must not be modified while they are mapped.
#[cfg(feature = "mmap")]
#[allow(unsafe_code)]
fn mmap_load(paths: &[PathBuf], device: &Device) -> Result<HashMap<String, Tensor>> {
    // SAFETY: safetensors files must not be modified while mapped.
    let mapped = unsafe { candle_core::safetensors::MmapedSafetensors::multi(paths)? };
    mapped
        .tensors()
        .into_iter()
        .map(|(name, _)| {
            let tensor = mapped.load(&name, device)?;
            Ok((name, tensor))
        })
        .collect()
}
