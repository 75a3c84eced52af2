use crate::hub::resolve_model_files;
use crate::lora::{var_builder_with_adapter, AdapterStatus};
use crate::utils::{device, parse_dtype};
use crate::ModelDescriptor;
use anyhow::{Context, Error as E, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::gemma2::{Config as Gemma2Config, Model as Gemma2Model};
use genie_inference_engine::{
    CancelFlag, EosTokenHandler, GenerationParameters, InferenceEngine, ModelInference, TextGenerator,
};
use std::fs::File;
use std::path::Path;
use tokenizers::{PaddingDirection, PaddingParams, Tokenizer};

#[allow(unused_imports)]
use tracing::{info, debug, error, warn};

pub const EOS_TOKEN: &str = "<eos>";
pub const END_OF_TURN_TOKEN: &str = "<end_of_turn>";
pub const PAD_TOKEN: &str = "<pad>";

pub struct GemmaModel {
    model: Gemma2Model,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    eos_handler: EosTokenHandler,
    pad_token_id: u32,
}

impl std::fmt::Debug for GemmaModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GemmaModel")
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .field("eos_handler", &self.eos_handler)
            .field("pad_token_id", &self.pad_token_id)
            .finish()
    }
}

impl GemmaModel {
    pub fn load(descriptor: &ModelDescriptor) -> Result<(Self, AdapterStatus)> {
        let device = device(descriptor.device)?;
        info!("Using device: {:?}", device);
        let dtype = parse_dtype(&descriptor.dtype, &device)?;
        info!("Using dtype: {:?}", dtype);

        let files = resolve_model_files(descriptor)?;

        let mut tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(E::msg)?;
        let pad_token_id = configure_padding(&mut tokenizer)?;
        let eos_handler = EosTokenHandler::from_ids([
            tokenizer.token_to_id(EOS_TOKEN),
            tokenizer.token_to_id(END_OF_TURN_TOKEN),
        ]);

        let model_config_file = File::open(&files.config)
            .with_context(|| format!("Failed to open model config file at {}", files.config.display()))?;
        let gemma_config: Gemma2Config = serde_json::from_reader(&model_config_file)?;

        // Flash attention is CUDA-only and must be compiled in
        let use_flash_attn = match device {
            Device::Cuda(_) => descriptor.use_flash_attn && cfg!(feature = "flash-attn"),
            _ => {
                if descriptor.use_flash_attn {
                    warn!("Flash attention is only supported on CUDA, disabling");
                }
                false
            }
        };

        let (vb, adapter) = var_builder_with_adapter(
            &files.weights,
            descriptor.lora_path.as_deref().map(Path::new),
            dtype,
            &device,
        )?;

        let model = Gemma2Model::new(use_flash_attn, &gemma_config, vb)
            .with_context(|| format!("Failed to build {} from its weights", descriptor.model_id))?;

        Ok((
            GemmaModel {
                model,
                tokenizer,
                device,
                dtype,
                eos_handler,
                pad_token_id,
            },
            adapter,
        ))
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, E> {
        self.tokenizer.decode(tokens, false).map_err(E::msg)
    }
}

fn encode_prompt(tokenizer: &Tokenizer, text: &str, max_input_tokens: usize) -> Result<Vec<u32>> {
    // The rendered prompt already starts with <bos>
    let mut tokens = tokenizer.encode(text, false).map_err(E::msg)?.get_ids().to_vec();

    if tokens.len() > max_input_tokens {
        warn!("Prompt has {} tokens, truncating to {}", tokens.len(), max_input_tokens);
        tokens.truncate(max_input_tokens);
    }

    Ok(tokens)
}

/// Left-pads with the tokenizer's pad token, aliasing it to `<eos>` when absent.
fn configure_padding(tokenizer: &mut Tokenizer) -> Result<u32> {
    let existing = tokenizer
        .get_padding()
        .map(|params| (params.pad_token.clone(), params.pad_id));
    let eos_id = tokenizer
        .token_to_id(EOS_TOKEN)
        .with_context(|| format!("Tokenizer defines no {EOS_TOKEN} token"))?;

    let (pad_token, pad_id) = choose_pad_token(existing, tokenizer.token_to_id(PAD_TOKEN), eos_id);
    debug!("Padding with {} ({})", pad_token, pad_id);

    tokenizer.with_padding(Some(PaddingParams {
        direction: PaddingDirection::Left,
        pad_id,
        pad_token,
        ..Default::default()
    }));

    Ok(pad_id)
}

fn choose_pad_token(existing: Option<(String, u32)>, pad_id: Option<u32>, eos_id: u32) -> (String, u32) {
    match (existing, pad_id) {
        (Some(existing), _) => existing,
        (None, Some(id)) => (PAD_TOKEN.to_string(), id),
        (None, None) => {
            warn!("Tokenizer has no padding token, using {}", EOS_TOKEN);
            (EOS_TOKEN.to_string(), eos_id)
        }
    }
}

/// 1 for every position that holds a real token, 0 for padding.
fn attention_mask(tokens: &[u32], pad_token_id: u32) -> Vec<u8> {
    tokens.iter().map(|&id| u8::from(id != pad_token_id)).collect()
}

fn unmasked(tokens: &[u32], mask: &[u8]) -> Vec<u32> {
    tokens
        .iter()
        .zip(mask)
        .filter(|(_, keep)| **keep == 1)
        .map(|(id, _)| *id)
        .collect()
}

impl ModelInference for GemmaModel {
    // Gemma keeps its KV cache inside the module; a clone shares the weights
    type Cache = Gemma2Model;

    fn create_cache(&self) -> Result<Self::Cache> {
        let mut model = self.model.clone();
        model.clear_kv_cache();
        Ok(model)
    }

    fn forward(&self, input: &Tensor, context_index: usize, cache: &mut Self::Cache) -> Result<Tensor> {
        let logits = cache.forward(input, context_index)?;
        logits.squeeze(1).map_err(E::from)
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn use_kv_cache(&self) -> bool {
        true
    }

    fn eos_handler(&self) -> &EosTokenHandler {
        &self.eos_handler
    }
}

impl TextGenerator for GemmaModel {
    fn generate(
        &self,
        prompt: &str,
        params: &GenerationParameters,
        cancel: &CancelFlag,
    ) -> Result<String, E> {
        let tokens = encode_prompt(&self.tokenizer, prompt, params.max_input_tokens)?;
        let mask = attention_mask(&tokens, self.pad_token_id);
        let mut tokens = unmasked(&tokens, &mask);

        let generated_tokens = InferenceEngine::generate(self, tokens.clone(), params, cancel)?;

        // Decode prompt and continuation together, as the sanitizer expects
        tokens.extend(generated_tokens);
        self.decode(&tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn word_tokenizer(vocab: &[(&str, u32)]) -> Tokenizer {
        let vocab: serde_json::Map<String, serde_json::Value> =
            vocab.iter().map(|(word, id)| (word.to_string(), (*id).into())).collect();
        let spec = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "WhitespaceSplit" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
        });
        Tokenizer::from_str(&spec.to_string()).unwrap()
    }

    const GEMMA_WORDS: [(&str, u32); 8] = [
        ("<pad>", 0),
        ("<eos>", 1),
        ("<bos>", 2),
        ("<unk>", 3),
        ("once", 4),
        ("upon", 5),
        ("a", 6),
        ("time", 7),
    ];

    #[test]
    fn test_long_prompt_is_truncated() {
        let tokenizer = word_tokenizer(&GEMMA_WORDS);

        let tokens = encode_prompt(&tokenizer, "<bos> once upon a time upon a time", 4).unwrap();
        assert_eq!(tokens, vec![2, 4, 5, 6]);

        let tokens = encode_prompt(&tokenizer, "<bos> once upon a time", 1024).unwrap();
        assert_eq!(tokens, vec![2, 4, 5, 6, 7]);
    }

    #[test]
    fn test_padding_is_left_with_pad_token() {
        let mut tokenizer = word_tokenizer(&GEMMA_WORDS);

        assert_eq!(configure_padding(&mut tokenizer).unwrap(), 0);

        let padding = tokenizer.get_padding().unwrap();
        assert!(matches!(padding.direction, PaddingDirection::Left));
        assert_eq!((padding.pad_token.as_str(), padding.pad_id), (PAD_TOKEN, 0));
    }

    #[test]
    fn test_padding_aliases_eos_without_pad_token() {
        let mut tokenizer = word_tokenizer(&GEMMA_WORDS[1..]);

        assert_eq!(configure_padding(&mut tokenizer).unwrap(), 1);

        let padding = tokenizer.get_padding().unwrap();
        assert!(matches!(padding.direction, PaddingDirection::Left));
        assert_eq!((padding.pad_token.as_str(), padding.pad_id), (EOS_TOKEN, 1));
    }

    #[test]
    fn test_tokenizer_without_eos_is_rejected() {
        let mut tokenizer = word_tokenizer(&[("<pad>", 0), ("<unk>", 1), ("once", 2)]);
        let err = configure_padding(&mut tokenizer).unwrap_err();
        assert!(err.to_string().contains("no <eos> token"));
    }

    #[test]
    fn test_existing_pad_token_is_kept() {
        let (token, id) = choose_pad_token(Some(("[PAD]".to_string(), 3)), Some(0), 1);
        assert_eq!((token.as_str(), id), ("[PAD]", 3));
    }

    #[test]
    fn test_vocabulary_pad_token_is_used() {
        let (token, id) = choose_pad_token(None, Some(0), 1);
        assert_eq!((token.as_str(), id), (PAD_TOKEN, 0));
    }

    #[test]
    fn test_missing_pad_token_aliases_eos() {
        let (token, id) = choose_pad_token(None, None, 1);
        assert_eq!((token.as_str(), id), (EOS_TOKEN, 1));
    }

    #[test]
    fn test_padding_positions_are_dropped() {
        let tokens = [0, 0, 2, 106, 1645];
        let mask = attention_mask(&tokens, 0);

        assert_eq!(mask, vec![0, 0, 1, 1, 1]);
        assert_eq!(unmasked(&tokens, &mask), vec![2, 106, 1645]);
    }
}
