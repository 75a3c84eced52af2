use anyhow::{Context, Error as E, Result, bail};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Compute device selection for the model
#[derive(ValueEnum, Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceHint {
    /// CUDA, then Metal, then CPU
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl std::fmt::Display for DeviceHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceHint::Auto => write!(f, "auto"),
            DeviceHint::Cpu => write!(f, "cpu"),
            DeviceHint::Cuda => write!(f, "cuda"),
            DeviceHint::Metal => write!(f, "metal"),
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct CliArgs {
    #[arg(long, env = "GENIE_DEBUG", default_value_t = false)]
    debug: bool,

    #[arg(long, env = "GENIE_MODEL_FAMILY", default_value = "gemma2")]
    model_family: String,

    /// HuggingFace repository of the base model.
    #[arg(long, env = "GENIE_MODEL_ID", default_value = "google/gemma-2-2b-it")]
    model_id: String,

    /// Local model directory; skips the hub when it exists.
    #[arg(long, env = "GENIE_MODEL_PATH")]
    model_path: Option<String>,

    #[arg(long, env = "GENIE_CACHE_DIR", default_value = "./ml_models_cache")]
    cache_dir: String,

    /// PEFT adapter directory merged into the base weights when present.
    #[arg(long, env = "GENIE_LORA_PATH", default_value = "./lora_storygenie_weights")]
    lora_path: Option<String>,

    #[arg(long, env = "GENIE_HF_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,

    #[arg(long, env = "GENIE_CONFIG_FILE")]
    config_file: Option<String>,

    #[arg(long, env = "GENIE_DEVICE", default_value_t = DeviceHint::Auto)]
    device: DeviceHint,

    /// Use different dtype than the device default (f16 on accelerators, f32 on CPU)
    #[arg(long, env = "GENIE_DTYPE")]
    dtype: Option<String>,

    #[arg(long, env = "GENIE_USE_FLASH_ATTN", default_value_t = false)]
    use_flash_attn: bool,

    /// Number of generations allowed to run at the same time.
    #[arg(long, env = "GENIE_WORKER_POOL_SIZE", default_value_t = 8)]
    worker_pool_size: usize,

    /// Budget for one generation, queueing included.
    #[arg(long, env = "GENIE_INFERENCE_TIMEOUT_SECS", default_value_t = 60)]
    inference_timeout_secs: u64,

    /// Prompts longer than this many tokens are truncated.
    #[arg(long, env = "GENIE_MAX_INPUT_TOKENS", default_value_t = 1024)]
    max_input_tokens: usize,

    /// Cleaned stories of this many characters or fewer count as failures.
    #[arg(long, env = "GENIE_MIN_STORY_CHARS", default_value_t = 50)]
    min_story_chars: usize,

    /// The temperature used to generate samples.
    #[arg(long, env = "GENIE_TEMPERATURE", default_value_t = 0.9)]
    temperature: f64,

    /// Nucleus sampling probability cutoff.
    #[arg(long, env = "GENIE_TOP_P", default_value_t = 0.9)]
    top_p: f64,

    /// Only sample among the top K samples.
    #[arg(long, env = "GENIE_TOP_K", default_value_t = 40)]
    top_k: usize,

    /// Penalty to be applied for repeating tokens, 1. means no penalty.
    #[arg(long, env = "GENIE_REPEAT_PENALTY", default_value_t = 1.1)]
    repeat_penalty: f32,

    /// The context size to consider for the repeat penalty.
    #[arg(long, env = "GENIE_REPEAT_LAST_N", default_value_t = 2048)]
    repeat_last_n: usize,

    /// Fixed sampling seed. A fresh seed is drawn per request when unset.
    #[arg(long, env = "GENIE_SEED")]
    seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenieConfig {
    pub debug: bool,
    pub model_family: String,
    pub model_id: String,
    pub model_path: Option<String>,
    pub cache_dir: String,
    pub lora_path: Option<String>,
    pub hf_token: Option<String>,
    pub device: DeviceHint,
    pub dtype: Option<String>,
    pub use_flash_attn: bool,
    pub worker_pool_size: usize,
    pub inference_timeout_secs: u64,
    pub max_input_tokens: usize,
    pub min_story_chars: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub seed: Option<u64>,
}

impl Default for GenieConfig {
    fn default() -> Self {
        GenieConfig {
            debug: false,
            model_family: String::from("gemma2"),
            model_id: String::from("google/gemma-2-2b-it"),
            model_path: None,
            cache_dir: String::from("./ml_models_cache"),
            lora_path: Some(String::from("./lora_storygenie_weights")),
            hf_token: None,
            device: DeviceHint::Auto,
            dtype: None,
            use_flash_attn: false,
            worker_pool_size: 8,
            inference_timeout_secs: 60,
            max_input_tokens: 1024,
            min_story_chars: 50,
            temperature: 0.9,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            repeat_last_n: 2048,
            seed: None,
        }
    }
}

impl GenieConfig {
    pub fn new() -> Result<GenieConfig, E> {
        let args = CliArgs::parse();

        let config = if let Some(config_file) = args.config_file {
            Self::from_yaml_file(Path::new(&config_file))?
        } else {
            GenieConfig {
                debug: args.debug,
                model_family: args.model_family,
                model_id: args.model_id,
                model_path: args.model_path,
                cache_dir: args.cache_dir,
                lora_path: args.lora_path,
                hf_token: args.hf_token,
                device: args.device,
                dtype: args.dtype,
                use_flash_attn: args.use_flash_attn,
                worker_pool_size: args.worker_pool_size,
                inference_timeout_secs: args.inference_timeout_secs,
                max_input_tokens: args.max_input_tokens,
                min_story_chars: args.min_story_chars,
                temperature: args.temperature,
                top_p: args.top_p,
                top_k: args.top_k,
                repeat_penalty: args.repeat_penalty,
                repeat_last_n: args.repeat_last_n,
                seed: args.seed,
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(config_path: &Path) -> Result<GenieConfig, E> {
        let content = fs::read_to_string(config_path).with_context(|| {
            format!("Config file not found: {}", config_path.to_string_lossy())
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<GenieConfig, E> {
        serde_yaml::from_str(content).with_context(|| "Failed to deserialize YAML config")
    }

    /// Rejects values the pipeline cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.model_id.trim().is_empty() {
            bail!("model_id must not be empty");
        }
        if self.worker_pool_size == 0 {
            bail!("worker_pool_size must be at least 1");
        }
        if self.inference_timeout_secs == 0 {
            bail!("inference_timeout_secs must be at least 1");
        }
        if self.max_input_tokens == 0 {
            bail!("max_input_tokens must be at least 1");
        }
        if let Some(dtype) = self.dtype.as_deref() {
            if !matches!(dtype, "f16" | "bf16" | "f32") {
                bail!("Unsupported dtype {dtype}");
            }
        }
        Ok(())
    }
}
