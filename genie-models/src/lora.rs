//! Merging a PEFT LoRA adapter into base weights before the model is built.
//!
//! Every `lora_A`/`lora_B` pair adds `scale * (B x A)` to the matching base
//! weight. The merged tensors then back an in-memory `VarBuilder`, so the
//! model itself needs no adapter support.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const ADAPTER_CONFIG: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS: &str = "adapter_model.safetensors";

const PEFT_PREFIX: &str = "base_model.model.";
const LORA_A_SUFFIX: &str = ".lora_A.weight";
const LORA_B_SUFFIX: &str = ".lora_B.weight";

/// Outcome of the fine-tuning merge. A failed merge still yields a usable model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterStatus {
    Absent,
    Merged { layers: usize },
    Failed(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub use_rslora: bool,
}

impl AdapterConfig {
    pub fn scale(&self) -> f64 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f64).sqrt()
        } else {
            self.lora_alpha / self.r as f64
        }
    }
}

pub struct LoraAdapter {
    config: AdapterConfig,
    tensors: HashMap<String, Tensor>,
}

impl LoraAdapter {
    pub fn new(config: AdapterConfig, tensors: HashMap<String, Tensor>) -> Result<Self> {
        if config.r == 0 {
            bail!("Adapter rank must be positive");
        }
        Ok(LoraAdapter { config, tensors })
    }

    pub fn load(adapter_dir: &Path, device: &Device) -> Result<Self> {
        let config_path = adapter_dir.join(ADAPTER_CONFIG);
        let config_file = File::open(&config_path)
            .with_context(|| format!("Failed to open {}", config_path.display()))?;
        let config: AdapterConfig = serde_json::from_reader(config_file)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let weights_path = adapter_dir.join(ADAPTER_WEIGHTS);
        let tensors = candle_core::safetensors::load(&weights_path, device)
            .with_context(|| format!("Failed to load {}", weights_path.display()))?;

        Self::new(config, tensors)
    }

    /// Folds every adapter pair into `weights`, returning how many were merged.
    pub fn merge_into(&self, weights: &mut HashMap<String, Tensor>) -> Result<usize> {
        let scale = self.config.scale();
        let mut merged = 0;

        for (key, lora_a) in &self.tensors {
            let Some(module) = key.strip_suffix(LORA_A_SUFFIX) else {
                continue;
            };
            let b_key = format!("{module}{LORA_B_SUFFIX}");
            let lora_b = self
                .tensors
                .get(&b_key)
                .with_context(|| format!("Adapter has {key} without {b_key}"))?;

            let base_name = format!("{}.weight", module.strip_prefix(PEFT_PREFIX).unwrap_or(module));
            let base = weights
                .get(&base_name)
                .with_context(|| format!("Adapter targets missing base weight {base_name}"))?;

            let delta = lora_b
                .to_dtype(DType::F32)?
                .matmul(&lora_a.to_dtype(DType::F32)?)?
                .affine(scale, 0.)?;
            if delta.dims() != base.dims() {
                bail!(
                    "Adapter delta {:?} does not match {} {:?}",
                    delta.dims(),
                    base_name,
                    base.dims()
                );
            }

            let updated = (base.to_dtype(DType::F32)? + delta)?.to_dtype(base.dtype())?;
            weights.insert(base_name, updated);
            merged += 1;
        }

        if merged == 0 {
            bail!("Adapter contains no LoRA weight pairs");
        }
        Ok(merged)
    }
}

fn load_base_weights(weight_files: &[PathBuf], device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut weights = HashMap::new();
    for file in weight_files {
        let shard = candle_core::safetensors::load(file, device)
            .with_context(|| format!("Failed to load {}", file.display()))?;
        weights.extend(shard);
    }
    Ok(weights)
}

/// Merges on the host and casts to `dtype` there, so only the final weights reach the accelerator.
fn merged_weights(weight_files: &[PathBuf], adapter_dir: &Path, dtype: DType) -> Result<(HashMap<String, Tensor>, usize)> {
    let adapter = LoraAdapter::load(adapter_dir, &Device::Cpu)?;
    let mut weights = load_base_weights(weight_files, &Device::Cpu)?;
    let layers = adapter.merge_into(&mut weights)?;

    let weights = weights
        .into_iter()
        .map(|(name, tensor)| -> Result<(String, Tensor)> { Ok((name, tensor.to_dtype(dtype)?)) })
        .collect::<Result<HashMap<_, _>>>()?;
    Ok((weights, layers))
}

fn mmaped(weight_files: &[PathBuf], dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(weight_files, dtype, device)? };
    Ok(vb)
}

/// Builds the weight source for the model, merging the adapter when one exists.
///
/// Only a failure to read the base weights is an error; a broken adapter is
/// reported through [`AdapterStatus::Failed`] and the base weights are used.
pub fn var_builder_with_adapter(
    weight_files: &[PathBuf],
    adapter_dir: Option<&Path>,
    dtype: DType,
    device: &Device,
) -> Result<(VarBuilder<'static>, AdapterStatus)> {
    let adapter_dir = match adapter_dir {
        Some(dir) if dir.is_dir() => dir,
        Some(dir) => {
            warn!("LoRA weights not found at {}. Using base model.", dir.display());
            return Ok((mmaped(weight_files, dtype, device)?, AdapterStatus::Absent));
        }
        None => return Ok((mmaped(weight_files, dtype, device)?, AdapterStatus::Absent)),
    };

    info!("Found LoRA weights at {}. Applying fine-tuning...", adapter_dir.display());
    match merged_weights(weight_files, adapter_dir, dtype) {
        Ok((weights, layers)) => {
            info!(layers, "LoRA weights merged into model");
            Ok((VarBuilder::from_tensors(weights, dtype, device), AdapterStatus::Merged { layers }))
        }
        Err(e) => {
            error!("Failed to load and merge LoRA weights: {:#}. Falling back to base model.", e);
            let vb = mmaped(weight_files, dtype, device)?;
            Ok((vb, AdapterStatus::Failed(format!("{e:#}"))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const Q_PROJ: &str = "model.layers.0.self_attn.q_proj.weight";

    fn adapter_tensors() -> HashMap<String, Tensor> {
        let a = Tensor::new(&[[1f32, 2.]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[1f32], [3.]], &Device::Cpu).unwrap();
        HashMap::from([
            (format!("{PEFT_PREFIX}model.layers.0.self_attn.q_proj{LORA_A_SUFFIX}"), a),
            (format!("{PEFT_PREFIX}model.layers.0.self_attn.q_proj{LORA_B_SUFFIX}"), b),
        ])
    }

    fn base_tensors() -> HashMap<String, Tensor> {
        HashMap::from([(Q_PROJ.to_string(), Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap())])
    }

    fn write_checkpoint(dir: &Path) -> PathBuf {
        let path = dir.join("model.safetensors");
        candle_core::safetensors::save(&base_tensors(), &path).unwrap();
        path
    }

    fn write_adapter(dir: &Path, config: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(ADAPTER_CONFIG), config).unwrap();
        candle_core::safetensors::save(&adapter_tensors(), dir.join(ADAPTER_WEIGHTS)).unwrap();
    }

    fn values(tensor: &Tensor) -> Vec<Vec<f32>> {
        tensor.to_vec2::<f32>().unwrap()
    }

    #[test]
    fn test_merge_adds_scaled_low_rank_product() {
        let config = AdapterConfig { r: 1, lora_alpha: 2.0, use_rslora: false };
        let adapter = LoraAdapter::new(config, adapter_tensors()).unwrap();
        let mut weights = base_tensors();

        assert_eq!(adapter.merge_into(&mut weights).unwrap(), 1);
        assert_eq!(values(&weights[Q_PROJ]), vec![vec![2., 4.], vec![6., 12.]]);
    }

    #[test]
    fn test_rslora_scale() {
        let config = AdapterConfig { r: 16, lora_alpha: 32.0, use_rslora: true };
        assert!((config.scale() - 8.0).abs() < 1e-9);
        let config = AdapterConfig { r: 16, lora_alpha: 32.0, use_rslora: false };
        assert!((config.scale() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge_rejects_missing_base_weight() {
        let config = AdapterConfig { r: 1, lora_alpha: 1.0, use_rslora: false };
        let adapter = LoraAdapter::new(config, adapter_tensors()).unwrap();
        let mut weights = HashMap::new();

        let err = adapter.merge_into(&mut weights).unwrap_err();
        assert!(err.to_string().contains("missing base weight"));
    }

    #[test]
    fn test_merge_rejects_adapter_without_pairs() {
        let config = AdapterConfig { r: 1, lora_alpha: 1.0, use_rslora: false };
        let adapter = LoraAdapter::new(config, HashMap::new()).unwrap();
        assert!(adapter.merge_into(&mut base_tensors()).is_err());
    }

    #[test]
    fn test_absent_adapter_uses_base_weights() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = write_checkpoint(dir.path());
        let missing = dir.path().join("no-adapter");

        let (vb, status) =
            var_builder_with_adapter(&[checkpoint], Some(&missing), DType::F32, &Device::Cpu).unwrap();

        assert_eq!(status, AdapterStatus::Absent);
        assert_eq!(values(&vb.get((2, 2), Q_PROJ).unwrap()), vec![vec![0., 0.], vec![0., 0.]]);
    }

    #[test]
    fn test_valid_adapter_is_merged() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = write_checkpoint(dir.path());
        let adapter_dir = dir.path().join("lora");
        write_adapter(&adapter_dir, r#"{"r": 1, "lora_alpha": 1.0, "target_modules": ["q_proj"]}"#);

        let (vb, status) =
            var_builder_with_adapter(&[checkpoint], Some(&adapter_dir), DType::F32, &Device::Cpu).unwrap();

        assert_eq!(status, AdapterStatus::Merged { layers: 1 });
        assert_eq!(values(&vb.get((2, 2), Q_PROJ).unwrap()), vec![vec![1., 2.], vec![3., 6.]]);
    }

    #[test]
    fn test_merge_runs_on_host_at_target_dtype() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = write_checkpoint(dir.path());
        let adapter_dir = dir.path().join("lora");
        write_adapter(&adapter_dir, r#"{"r": 1, "lora_alpha": 1.0}"#);

        let (weights, layers) = merged_weights(&[checkpoint.clone()], &adapter_dir, DType::F16).unwrap();
        assert_eq!(layers, 1);
        assert_eq!(weights[Q_PROJ].dtype(), DType::F16);
        assert!(weights[Q_PROJ].device().is_cpu());

        let (vb, _) =
            var_builder_with_adapter(&[checkpoint], Some(&adapter_dir), DType::F16, &Device::Cpu).unwrap();
        let q_proj = vb.get((2, 2), Q_PROJ).unwrap();
        assert_eq!(q_proj.dtype(), DType::F16);
        assert_eq!(values(&q_proj.to_dtype(DType::F32).unwrap()), vec![vec![1., 2.], vec![3., 6.]]);
    }

    #[test]
    fn test_broken_adapter_falls_back_to_base_weights() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = write_checkpoint(dir.path());
        let adapter_dir = dir.path().join("lora");
        write_adapter(&adapter_dir, "not json");

        let (vb, status) =
            var_builder_with_adapter(&[checkpoint], Some(&adapter_dir), DType::F32, &Device::Cpu).unwrap();

        assert!(matches!(status, AdapterStatus::Failed(reason) if reason.contains(ADAPTER_CONFIG)));
        assert_eq!(values(&vb.get((2, 2), Q_PROJ).unwrap()), vec![vec![0., 0.], vec![0., 0.]]);
    }

    #[test]
    fn test_unreadable_base_weights_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("model.safetensors");

        assert!(var_builder_with_adapter(&[missing], None, DType::F32, &Device::Cpu).is_err());
    }
}
