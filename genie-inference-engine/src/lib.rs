pub mod inference_engine;
pub mod eos;
pub mod textgenerator;

pub use inference_engine::{InferenceEngine, GenerationParameters, ModelInference};
pub use eos::EosTokenHandler;
pub use textgenerator::{CancelFlag, TextGenerator};
