use crate::demonstrations::DemonstrationBank;
use crate::executor::{ExecutionError, ExecutorConfig, GenerationExecutor};
use crate::lifecycle::{HubModelLoader, LifecycleError, ModelLifecycleManager, ModelLoader, PipelineState};
use crate::prompt::{PromptBuilder, PromptComposer, PromptError};
use crate::request::GenerationRequest;
use crate::sanitizer::{CleanedStory, OutputSanitizer, SanitizeError};
use crate::story::StoryDraft;
use genie_config::GenieConfig;
use genie_models::{AdapterStatus, ModelDescriptor};
use std::sync::Arc;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

#[allow(unused_imports)]
use tracing::{info, debug, error, warn};

/// What a caller sees when a story could not be produced.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationFailure {
    #[error("AI service is not ready. Please check backend logs for model loading status.")]
    NotReady,
    #[error("AI story generation failed. Final text too short or empty. Try a different prompt.")]
    TooShort,
    #[error("AI story generation failed due to an internal error. Please check logs.")]
    Internal,
    #[error("Invalid story request: {0}")]
    InvalidRequest(String),
}

impl From<PromptError> for GenerationFailure {
    fn from(e: PromptError) -> Self {
        match e {
            PromptError::InvalidRequest(reason) => {
                warn!(reason = %reason, "Rejected story request");
                GenerationFailure::InvalidRequest(reason.to_string())
            }
            PromptError::Template(e) => {
                error!("Prompt composition failed: {:#}", e);
                GenerationFailure::Internal
            }
        }
    }
}

impl From<ExecutionError> for GenerationFailure {
    fn from(e: ExecutionError) -> Self {
        match e {
            ExecutionError::NotReady | ExecutionError::Closed => {
                warn!("Inference unavailable: {}", e);
                GenerationFailure::NotReady
            }
            ExecutionError::TimedOut(timeout) => {
                error!(timeout = ?timeout, "Story generation timed out");
                GenerationFailure::Internal
            }
            e => {
                error!("Story generation critical error: {}", e);
                GenerationFailure::Internal
            }
        }
    }
}

impl From<SanitizeError> for GenerationFailure {
    fn from(e: SanitizeError) -> Self {
        error!("Story generation failed, final text too short or empty: {}", e);
        GenerationFailure::TooShort
    }
}

/// One request in, one cleaned story out.
#[derive(Debug)]
pub struct StoryPipeline<C: PromptBuilder = PromptComposer> {
    composer: C,
    lifecycle: ModelLifecycleManager,
    executor: GenerationExecutor,
    sanitizer: OutputSanitizer,
}

impl StoryPipeline<PromptComposer> {
    pub fn new(config: &GenieConfig) -> anyhow::Result<Self> {
        let composer = PromptComposer::new(DemonstrationBank::default())?;
        let loader = HubModelLoader::new(ModelDescriptor::from(config));

        Ok(StoryPipeline::with_parts(
            composer,
            Arc::new(loader),
            ExecutorConfig::from(config),
            OutputSanitizer::new(config.min_story_chars),
        ))
    }
}

impl<C: PromptBuilder> StoryPipeline<C> {
    pub fn with_parts(
        composer: C,
        loader: Arc<dyn ModelLoader>,
        executor: ExecutorConfig,
        sanitizer: OutputSanitizer,
    ) -> Self {
        StoryPipeline {
            composer,
            lifecycle: ModelLifecycleManager::new(loader),
            executor: GenerationExecutor::new(executor),
            sanitizer,
        }
    }

    pub async fn initialize(&self) -> Result<AdapterStatus, LifecycleError> {
        let adapter = self.lifecycle.initialize().await?;
        info!(adapter = ?adapter, "Story pipeline initialized");
        Ok(adapter)
    }

    pub async fn state(&self) -> PipelineState {
        self.lifecycle.state().await
    }

    pub fn executor(&self) -> &GenerationExecutor {
        &self.executor
    }

    pub async fn generate(&self, request: &GenerationRequest, caller: &str) -> Result<CleanedStory, GenerationFailure> {
        let job_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "generate",
            %job_id,
            caller,
            language = %request.language,
            genre = %request.genre
        );

        self.run(request).instrument(span).await
    }

    pub async fn draft(&self, request: &GenerationRequest, caller: &str) -> Result<StoryDraft, GenerationFailure> {
        let story = self.generate(request, caller).await?;
        Ok(StoryDraft::new(request, story))
    }

    pub async fn shutdown(&self) {
        self.executor.close();
        self.lifecycle.shutdown().await;
        info!("Story pipeline shut down");
    }

    async fn run(&self, request: &GenerationRequest) -> Result<CleanedStory, GenerationFailure> {
        let state = self.lifecycle.state().await;
        if state != PipelineState::Ready {
            warn!(state = ?state, "Story requested before the model is ready");
            return Err(GenerationFailure::NotReady);
        }
        let Some(handle) = self.lifecycle.handle(&request.language).await else {
            warn!("No model registered for this language");
            return Err(GenerationFailure::NotReady);
        };

        info!("Generating story");
        let prompt = self.composer.compose(request)?;
        let raw = self
            .executor
            .execute(Some(handle), &request.language, prompt, &request.length)
            .await?;

        let story = self.sanitizer.finish(&raw)?;
        info!(chars = story.as_str().chars().count(), "Story generated");
        Ok(story)
    }
}
