pub mod utils;
pub mod hub;
pub mod lora;

#[cfg(feature = "gemma2")]
pub mod gemma;

#[cfg(feature = "gemma2")]
pub use gemma::GemmaModel;

use anyhow::{bail, Error as E, Result};
use genie_config::{DeviceHint, GenieConfig};
use genie_inference_engine::TextGenerator;
use std::path::PathBuf;
use std::sync::Arc;

pub use lora::AdapterStatus;

/// Everything needed to locate and load the base model. Fixed after startup.
#[derive(Clone)]
pub struct ModelDescriptor {
    pub model_family: String,
    pub model_id: String,
    pub model_path: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub device: DeviceHint,
    pub dtype: Option<String>,
    pub auth_token: Option<String>,
    pub lora_path: Option<PathBuf>,
    pub use_flash_attn: bool,
}

impl std::fmt::Debug for ModelDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelDescriptor")
            .field("model_family", &self.model_family)
            .field("model_id", &self.model_id)
            .field("model_path", &self.model_path)
            .field("cache_dir", &self.cache_dir)
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("lora_path", &self.lora_path)
            .field("use_flash_attn", &self.use_flash_attn)
            .finish()
    }
}

impl From<&GenieConfig> for ModelDescriptor {
    fn from(config: &GenieConfig) -> Self {
        ModelDescriptor {
            model_family: config.model_family.clone(),
            model_id: config.model_id.clone(),
            model_path: config.model_path.as_ref().map(PathBuf::from),
            cache_dir: PathBuf::from(&config.cache_dir),
            device: config.device,
            dtype: config.dtype.clone(),
            auth_token: config.hf_token.clone(),
            lora_path: config.lora_path.as_ref().map(PathBuf::from),
            use_flash_attn: config.use_flash_attn,
        }
    }
}

/// A model ready for inference, plus the outcome of the adapter merge.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub generator: Arc<dyn TextGenerator>,
    pub adapter: AdapterStatus,
}

/// Factory function to load the model family named by the descriptor
pub fn create_model(descriptor: &ModelDescriptor) -> Result<LoadedModel, E> {
    match descriptor.model_family.as_str() {
        #[cfg(feature = "gemma2")]
        "gemma2" => {
            let (model, adapter) = GemmaModel::load(descriptor)?;
            Ok(LoadedModel { generator: Arc::new(model), adapter })
        }

        _ => bail!("Unsupported model family: {}", descriptor.model_family),
    }
}
