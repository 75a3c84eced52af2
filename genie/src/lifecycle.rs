use crate::request::Language;
use anyhow::anyhow;
use genie_inference_engine::TextGenerator;
use genie_models::{create_model, AdapterStatus, LoadedModel, ModelDescriptor};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[allow(unused_imports)]
use tracing::{info, debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Uninitialized,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("model lifecycle already started, current state is {0:?}")]
    AlreadyInitialized(PipelineState),
    #[error("failed to load the base model: {0:#}")]
    LoadFailed(anyhow::Error),
}

/// Blocking model load. Runs once, on a blocking thread.
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> anyhow::Result<LoadedModel>;
}

#[derive(Debug, Clone)]
pub struct HubModelLoader {
    descriptor: ModelDescriptor,
}

impl HubModelLoader {
    pub fn new(descriptor: ModelDescriptor) -> Self {
        HubModelLoader { descriptor }
    }
}

impl ModelLoader for HubModelLoader {
    fn load(&self) -> anyhow::Result<LoadedModel> {
        info!(model_id = %self.descriptor.model_id, "Loading main model");
        create_model(&self.descriptor)
    }
}

/// Owns the loaded model and hands out one shared handle per supported language.
pub struct ModelLifecycleManager {
    loader: Arc<dyn ModelLoader>,
    state: RwLock<PipelineState>,
    handles: RwLock<HashMap<Language, Arc<dyn TextGenerator>>>,
}

impl std::fmt::Debug for ModelLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLifecycleManager").finish_non_exhaustive()
    }
}

impl ModelLifecycleManager {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        ModelLifecycleManager {
            loader,
            state: RwLock::new(PipelineState::Uninitialized),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Loads the model and registers it for every supported language.
    ///
    /// A failed adapter merge still ends in `Ready`; only a base model or
    /// tokenizer failure ends in `Failed`. Either way the state is final.
    pub async fn initialize(&self) -> Result<AdapterStatus, LifecycleError> {
        {
            let mut state = self.state.write().await;
            if *state != PipelineState::Uninitialized {
                return Err(LifecycleError::AlreadyInitialized(*state));
            }
            *state = PipelineState::Loading;
        }
        info!("Initializing story pipeline");

        let loader = Arc::clone(&self.loader);
        let loaded = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|e| anyhow!("model loading task failed: {}", e))
            .and_then(|result| result);

        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("Failed to load main model: {:#}", e);
                *self.state.write().await = PipelineState::Failed;
                return Err(LifecycleError::LoadFailed(e));
            }
        };

        if let AdapterStatus::Failed(reason) = &loaded.adapter {
            warn!(reason = %reason, "Serving the base model without fine-tuning");
        }

        {
            let mut handles = self.handles.write().await;
            for language in Language::SUPPORTED {
                handles.insert(language, Arc::clone(&loaded.generator));
            }
        }
        *self.state.write().await = PipelineState::Ready;

        info!("Main model loaded and assigned to en, hi, te");
        Ok(loaded.adapter)
    }

    pub async fn state(&self) -> PipelineState {
        *self.state.read().await
    }

    pub async fn handle(&self, language: &Language) -> Option<Arc<dyn TextGenerator>> {
        self.handles.read().await.get(language).cloned()
    }

    /// Drops the handles. Calls still running keep their own clone until they finish.
    pub async fn shutdown(&self) {
        let mut handles = self.handles.write().await;
        if !handles.is_empty() {
            info!(languages = handles.len(), "Releasing model handles");
        }
        handles.clear();
    }
}
