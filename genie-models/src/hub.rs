//! Locating model files on disk or in the HuggingFace hub cache.

use anyhow::{bail, Context, Result};
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::utils::{shard_names, SAFETENSORS_INDEX, SAFETENSORS_SINGLE};
use crate::ModelDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

/// Uses the local model directory when it exists, the hub otherwise.
pub fn resolve_model_files(descriptor: &ModelDescriptor) -> Result<ModelFiles> {
    match descriptor.model_path.as_deref() {
        Some(dir) if dir.is_dir() => resolve_local(dir),
        Some(dir) => {
            info!("Model directory {} not found, falling back to the hub", dir.display());
            resolve_hub(descriptor)
        }
        None => resolve_hub(descriptor),
    }
}

pub fn resolve_local(model_dir: &Path) -> Result<ModelFiles> {
    if !model_dir.is_dir() {
        bail!("Model path is not a directory: {}", model_dir.display());
    }

    let required = |name: &str| -> Result<PathBuf> {
        let path = model_dir.join(name);
        if !path.is_file() {
            bail!("Missing {} in {}", name, model_dir.display());
        }
        Ok(path)
    };

    let config = required("config.json")?;
    let tokenizer = required("tokenizer.json")?;

    let index = model_dir.join(SAFETENSORS_INDEX);
    let weights = if index.is_file() {
        shard_names(&index)?
            .into_iter()
            .map(|name| model_dir.join(name))
            .collect()
    } else {
        vec![required(SAFETENSORS_SINGLE)?]
    };

    Ok(ModelFiles { config, tokenizer, weights })
}

fn resolve_hub(descriptor: &ModelDescriptor) -> Result<ModelFiles> {
    info!(model_id = %descriptor.model_id, cache_dir = %descriptor.cache_dir.display(), "Resolving model from the hub");

    let api = ApiBuilder::new()
        .with_cache_dir(descriptor.cache_dir.clone())
        .with_token(descriptor.auth_token.clone())
        .with_progress(false)
        .build()
        .context("Failed to initialize HuggingFace API")?;
    let repo = api.model(descriptor.model_id.clone());

    let fetch = |name: &str| -> Result<PathBuf> {
        repo.get(name)
            .with_context(|| format!("Failed to fetch {} from {}", name, descriptor.model_id))
    };

    let config = fetch("config.json")?;
    let tokenizer = fetch("tokenizer.json")?;
    let weights = hub_weights(&repo, &descriptor.model_id)?;

    Ok(ModelFiles { config, tokenizer, weights })
}

fn hub_weights(repo: &ApiRepo, model_id: &str) -> Result<Vec<PathBuf>> {
    if let Ok(index) = repo.get(SAFETENSORS_INDEX) {
        let shards = shard_names(&index)?;
        info!(num_shards = shards.len(), "Downloading model shards");
        return shards
            .iter()
            .map(|name| {
                debug!(shard = %name, "Fetching shard");
                repo.get(name)
                    .with_context(|| format!("Failed to fetch shard {} from {}", name, model_id))
            })
            .collect();
    }

    let single = repo
        .get(SAFETENSORS_SINGLE)
        .with_context(|| format!("No safetensors weights found in {}", model_id))?;
    Ok(vec![single])
}
