pub mod demonstrations;
pub mod executor;
pub mod lifecycle;
pub mod pipeline;
pub mod prompt;
pub mod request;
pub mod sanitizer;
pub mod story;

pub use demonstrations::{DemonstrationBank, DemonstrationExample};
pub use executor::{ExecutionError, ExecutorConfig, GenerationExecutor};
pub use lifecycle::{HubModelLoader, LifecycleError, ModelLifecycleManager, ModelLoader, PipelineState};
pub use pipeline::{GenerationFailure, StoryPipeline};
pub use prompt::{PromptBuilder, PromptComposer, PromptError};
pub use request::{GenerationRequest, Genre, Language, LengthClass, Tone};
pub use sanitizer::{CleanedStory, OutputSanitizer};
pub use story::StoryDraft;
