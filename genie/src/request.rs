//! The story request a caller submits, and the values derived from it.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const MAX_PROMPT_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Language {
    English,
    Hindi,
    Telugu,
    /// A code outside the supported set, carried through unchanged.
    Other(String),
}

impl Language {
    pub const SUPPORTED: [Language; 3] = [Language::English, Language::Hindi, Language::Telugu];

    pub fn code(&self) -> &str {
        match self {
            Language::English => "en",
            Language::Hindi => "hi",
            Language::Telugu => "te",
            Language::Other(code) => code,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Language::English => "English",
            Language::Hindi => "Hindi",
            Language::Telugu => "Telugu",
            Language::Other(_) => "language",
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Language::Other(_))
    }
}

impl From<String> for Language {
    fn from(code: String) -> Self {
        match code.as_str() {
            "en" => Language::English,
            "hi" => Language::Hindi,
            "te" => Language::Telugu,
            _ => Language::Other(code),
        }
    }
}

impl From<&str> for Language {
    fn from(code: &str) -> Self {
        Language::from(code.to_string())
    }
}

impl From<Language> for String {
    fn from(language: Language) -> Self {
        match language {
            Language::Other(code) => code,
            supported => supported.code().to_string(),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Genre {
    Fantasy,
    Mystery,
    Horror,
    Romance,
    #[serde(rename = "sci-fi")]
    SciFi,
    Adventure,
    Historical,
    Comedy,
}

impl Genre {
    pub const ALL: [Genre; 8] = [
        Genre::Fantasy,
        Genre::Mystery,
        Genre::Horror,
        Genre::Romance,
        Genre::SciFi,
        Genre::Adventure,
        Genre::Historical,
        Genre::Comedy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Genre::Fantasy => "fantasy",
            Genre::Mystery => "mystery",
            Genre::Horror => "horror",
            Genre::Romance => "romance",
            Genre::SciFi => "sci-fi",
            Genre::Adventure => "adventure",
            Genre::Historical => "historical",
            Genre::Comedy => "comedy",
        }
    }
}

impl fmt::Display for Genre {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LengthClass {
    Short,
    Medium,
    Long,
    Other(String),
}

impl LengthClass {
    pub fn as_str(&self) -> &str {
        match self {
            LengthClass::Short => "short",
            LengthClass::Medium => "medium",
            LengthClass::Long => "long",
            LengthClass::Other(value) => value,
        }
    }

    pub fn max_new_tokens(&self) -> usize {
        match self {
            LengthClass::Short => 300,
            LengthClass::Medium => 500,
            LengthClass::Long => 700,
            LengthClass::Other(_) => 400,
        }
    }

    /// How the target length is phrased in the instructions.
    pub fn phrase(&self) -> &'static str {
        match self {
            LengthClass::Short => "a short story (around 200 words)",
            LengthClass::Medium => "a medium-length story (around 400 words)",
            LengthClass::Long => "a long and detailed story (around 600 words)",
            LengthClass::Other(_) => "a medium-length story",
        }
    }
}

impl From<String> for LengthClass {
    fn from(value: String) -> Self {
        match value.as_str() {
            "short" => LengthClass::Short,
            "medium" => LengthClass::Medium,
            "long" => LengthClass::Long,
            _ => LengthClass::Other(value),
        }
    }
}

impl From<LengthClass> for String {
    fn from(length: LengthClass) -> Self {
        match length {
            LengthClass::Other(value) => value,
            mapped => mapped.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Dramatic,
    #[default]
    LightHearted,
    Humorous,
    Dark,
    Serious,
}

impl Tone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tone::Dramatic => "dramatic",
            Tone::LightHearted => "light_hearted",
            Tone::Humorous => "humorous",
            Tone::Dark => "dark",
            Tone::Serious => "serious",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("prompt is {0} characters, the limit is {MAX_PROMPT_CHARS}")]
    PromptTooLong(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub genre: Genre,
    pub language: Language,
    pub length: LengthClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<Tone>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub characters: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setting: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, genre: Genre, language: Language, length: LengthClass) -> Self {
        GenerationRequest {
            prompt: prompt.into(),
            genre,
            language,
            length,
            tone: None,
            characters: None,
            setting: None,
        }
    }

    pub fn tone(&self) -> Tone {
        self.tone.unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        let chars = self.prompt.chars().count();
        if chars == 0 {
            return Err(RequestError::EmptyPrompt);
        }
        if chars > MAX_PROMPT_CHARS {
            return Err(RequestError::PromptTooLong(chars));
        }
        Ok(())
    }
}
