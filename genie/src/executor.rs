use crate::request::{Language, LengthClass};
use genie_config::GenieConfig;
use genie_inference_engine::{CancelFlag, GenerationParameters, TextGenerator};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use uuid::Uuid;

#[allow(unused_imports)]
use tracing::{info, debug, error, warn};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("no inference handle available")]
    NotReady,
    #[error("executor is closed")]
    Closed,
    #[error("inference did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("inference failed: {0:#}")]
    Inference(anyhow::Error),
    #[error("inference worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Pool size, time budget and the sampling values every call shares.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    pub worker_pool_size: usize,
    pub timeout: Duration,
    pub max_input_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub seed: Option<u64>,
}

impl From<&GenieConfig> for ExecutorConfig {
    fn from(config: &GenieConfig) -> Self {
        ExecutorConfig {
            worker_pool_size: config.worker_pool_size,
            timeout: Duration::from_secs(config.inference_timeout_secs),
            max_input_tokens: config.max_input_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            repeat_penalty: config.repeat_penalty,
            repeat_last_n: config.repeat_last_n,
            seed: config.seed,
        }
    }
}

impl ExecutorConfig {
    pub fn parameters(&self, length: &LengthClass) -> GenerationParameters {
        GenerationParameters {
            max_new_tokens: length.max_new_tokens(),
            max_input_tokens: self.max_input_tokens,
            temperature: self.temperature,
            top_k: Some(self.top_k),
            top_p: Some(self.top_p),
            seed: self.seed.unwrap_or_else(fresh_seed),
            repeat_penalty: self.repeat_penalty,
            repeat_last_n: self.repeat_last_n,
        }
    }
}

fn fresh_seed() -> u64 {
    Uuid::new_v4().as_u64_pair().0
}

struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs blocking generation calls on a bounded pool.
///
/// At most `worker_pool_size` calls hold a permit at once, the rest wait in
/// FIFO order. The timeout covers the wait and the call. A timed-out call is
/// asked to stop through its [`CancelFlag`] and keeps its permit until the
/// blocking work actually returns.
#[derive(Debug)]
pub struct GenerationExecutor {
    config: ExecutorConfig,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    submitted: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
}

impl GenerationExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_pool_size));
        GenerationExecutor {
            config,
            permits,
            closed: AtomicBool::new(false),
            submitted: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub async fn execute(
        &self,
        handle: Option<Arc<dyn TextGenerator>>,
        language: &Language,
        prompt: String,
        length: &LengthClass,
    ) -> Result<String, ExecutionError> {
        let Some(generator) = handle else {
            warn!(language = %language, "No inference handle for language");
            return Err(ExecutionError::NotReady);
        };
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecutionError::Closed);
        }
        self.submitted.fetch_add(1, Ordering::SeqCst);

        let params = self.config.parameters(length);
        debug!(
            language = %language,
            max_new_tokens = params.max_new_tokens,
            seed = params.seed,
            "Submitting generation"
        );

        let cancel = CancelFlag::new();
        let permits = Arc::clone(&self.permits);
        let in_flight = Arc::clone(&self.in_flight);
        let worker_cancel = cancel.clone();

        let work = async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|_| ExecutionError::Closed)?;

            let output = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let _in_flight = InFlightGuard::enter(in_flight);
                generator.generate(&prompt, &params, &worker_cancel)
            })
            .await??;

            Ok::<_, ExecutionError>(output)
        };

        match tokio::time::timeout(self.config.timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                warn!(language = %language, timeout = ?self.config.timeout, "Generation timed out, cancelling");
                Err(ExecutionError::TimedOut(self.config.timeout))
            }
        }
    }

    /// Rejects new calls and wakes queued ones with [`ExecutionError::Closed`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(in_flight = self.in_flight(), "Closing generation executor");
            self.permits.close();
        }
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl From<anyhow::Error> for ExecutionError {
    fn from(e: anyhow::Error) -> Self {
        ExecutionError::Inference(e)
    }
}
