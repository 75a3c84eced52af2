use anyhow::{bail, Context, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device};
use genie_config::DeviceHint;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;
use tracing::info;

pub const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";
pub const SAFETENSORS_SINGLE: &str = "model.safetensors";

pub fn device(hint: DeviceHint) -> Result<Device> {
    match hint {
        DeviceHint::Cpu => Ok(Device::Cpu),
        DeviceHint::Cuda => Device::new_cuda(0).context("CUDA device requested but unavailable"),
        DeviceHint::Metal => Device::new_metal(0).context("Metal device requested but unavailable"),
        DeviceHint::Auto => {
            if cuda_is_available() {
                info!("Running on CUDA device");
                Ok(Device::new_cuda(0)?)
            } else if metal_is_available() {
                info!("Running on Metal device");
                Ok(Device::new_metal(0)?)
            } else {
                info!("Running on CPU");
                Ok(Device::Cpu)
            }
        }
    }
}

/// Half precision on accelerators, full precision on CPU unless configured.
pub fn parse_dtype(dtype: &Option<String>, device: &Device) -> Result<DType> {
    match dtype.as_deref() {
        Some("f16") => Ok(DType::F16),
        Some("bf16") => Ok(DType::BF16),
        Some("f32") => Ok(DType::F32),
        Some(dtype) => bail!("Unsupported dtype {dtype}"),
        None if device.is_cpu() => Ok(DType::F32),
        None => Ok(DType::F16),
    }
}

/// Unique shard file names listed in a sharded checkpoint index, sorted.
pub fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let model_index_file = File::open(index_path)
        .with_context(|| format!("Failed to open {}", index_path.display()))?;
    let model_index_json: Value = serde_json::from_reader(&model_index_file)?;
    let model_weight_map = match model_index_json.get("weight_map") {
        None => bail!("no weight map in {}", index_path.display()),
        Some(Value::Object(map)) => map,
        Some(_) => bail!("weight map in {} is not a map", index_path.display()),
    };

    let shards: BTreeSet<String> = model_weight_map
        .values()
        .filter_map(|value| value.as_str())
        .map(String::from)
        .collect();

    if shards.is_empty() {
        bail!("weight map in {} lists no files", index_path.display());
    }

    Ok(shards.into_iter().collect())
}
