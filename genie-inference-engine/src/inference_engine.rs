use anyhow::{Result, bail};
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use crate::{CancelFlag, EosTokenHandler};

#[allow(unused_imports)]
use tracing::{info, debug};

/// Per-call decoding settings. Derived by the pipeline, never taken from the user.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParameters {
    pub max_new_tokens: usize,
    pub max_input_tokens: usize,
    pub temperature: f64,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    pub seed: u64,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
}

impl GenerationParameters {
    pub fn create_logits_processor(&self) -> LogitsProcessor {
        let sampling = if self.temperature <= 0. {
            debug!("Using ArgMax sampling (greedy)");
            Sampling::ArgMax
        } else {
            let temperature = self.temperature;
            match (self.top_k, self.top_p) {
                (None, None) => {
                    debug!("Using All sampling with temperature: {}", temperature);
                    Sampling::All { temperature }
                },
                (Some(k), None) => {
                    debug!("Using TopK sampling: k={}, temperature={}", k, temperature);
                    Sampling::TopK { k, temperature }
                },
                (None, Some(p)) => {
                    debug!("Using TopP sampling: p={}, temperature={}", p, temperature);
                    Sampling::TopP { p, temperature }
                },
                (Some(k), Some(p)) => {
                    debug!("Using TopKThenTopP sampling: k={}, p={}, temperature={}", k, p, temperature);
                    Sampling::TopKThenTopP { k, p, temperature }
                },
            }
        };
        LogitsProcessor::from_sampling(self.seed, sampling)
    }
}

/// A causal language model that can be stepped one forward pass at a time.
///
/// `Cache` carries the per-call decoding state, so one loaded model can serve
/// several generations concurrently.
pub trait ModelInference: Send + Sync {
    type Cache;

    fn create_cache(&self) -> Result<Self::Cache>;
    /// Returns logits for the last position, shaped `(batch, vocab)`.
    fn forward(&self, input: &Tensor, context_index: usize, cache: &mut Self::Cache) -> Result<Tensor>;
    fn device(&self) -> &Device;
    fn use_kv_cache(&self) -> bool;
    fn eos_handler(&self) -> &EosTokenHandler;
}

pub struct InferenceEngine;

impl InferenceEngine {
    /// Samples up to `params.max_new_tokens` tokens after `tokens`.
    ///
    /// Stops early on an end-of-sequence token. Returns only the new tokens.
    pub fn generate<M: ModelInference>(
        model: &M,
        mut tokens: Vec<u32>,
        params: &GenerationParameters,
        cancel: &CancelFlag,
    ) -> Result<Vec<u32>> {
        if tokens.is_empty() {
            bail!("Cannot generate from an empty prompt");
        }

        let mut cache = model.create_cache()?;
        let mut logits_processor = params.create_logits_processor();

        debug!("Starting generation with {} initial tokens, KV cache: {}",
              tokens.len(), model.use_kv_cache());

        let mut token_generated = 0;
        let mut generated_tokens = Vec::new();

        let prefill_start = std::time::Instant::now();
        let mut generation_start: Option<std::time::Instant> = None;

        for index in 0..params.max_new_tokens {
            if cancel.is_cancelled() {
                bail!("Generation cancelled after {} tokens", token_generated);
            }

            let (context_size, context_index) = if model.use_kv_cache() && index > 0 {
                (1, tokens.len() - 1)
            } else {
                (tokens.len(), 0)
            };

            let ctxt = &tokens[tokens.len().saturating_sub(context_size)..];

            if index < 3 || index % 50 == 0 {
                debug!("Token {}: context_size={}, context_index={}, total_tokens={}",
                       index, context_size, context_index, tokens.len());
            }

            let forward_start = std::time::Instant::now();

            let input = Tensor::new(ctxt, model.device())?.unsqueeze(0)?;
            let logits = model.forward(&input, context_index, &mut cache)?;
            let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
            let forward_time = forward_start.elapsed();

            let logits = if params.repeat_penalty != 1. {
                let start_at = tokens.len().saturating_sub(params.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    params.repeat_penalty,
                    &tokens[start_at..],
                )?
            } else {
                logits
            };

            let next_token = logits_processor.sample(&logits)?;

            if index < 5 || index % 50 == 0 {
                debug!("Token {}: forward={:?}", index, forward_time);
            }
            token_generated += 1;
            tokens.push(next_token);
            generated_tokens.push(next_token);

            // Start generation timer after first token (exclude prefill)
            if generation_start.is_none() {
                let prefill_time = prefill_start.elapsed();
                debug!("Prefill completed in {:?} for {} tokens", prefill_time, tokens.len() - 1);
                generation_start = Some(std::time::Instant::now());
            }

            if model.eos_handler().is_eos_token(next_token) {
                break;
            }
        }

        let total_time = prefill_start.elapsed();
        let generation_time = generation_start.map(|s| s.elapsed()).unwrap_or_default();

        let generation_tokens_per_second = if generation_time.as_secs_f64() > 0.0 {
            (token_generated - 1) as f64 / generation_time.as_secs_f64()
        } else {
            0.0
        };

        info!(
            "{} tokens generated | Generation only: {:.2} tok/s | Prefill: {:?} | Generation: {:?}",
            token_generated, generation_tokens_per_second,
            total_time - generation_time, generation_time
        );

        Ok(generated_tokens)
    }
}
