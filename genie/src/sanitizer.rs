//! Strips prompt echo and control markers from decoded model output.
//!
//! The model returns the whole transcript: the demonstration, the
//! instructions and the new turn, all with their special tokens. Each stage
//! below is a pure function and the stages run in order:
//!
//! 1. keep the final model turn,
//! 2. cut at any echoed demonstration boundary,
//! 3. scrub control markers and bare role words,
//! 4. drop short noise lines and reflow into paragraphs,
//! 5. close the last sentence.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub const MODEL_TURN_MARKER: &str = "<start_of_turn>model\n";
pub const EXAMPLE_START: &str = "<EXAMPLE_START>";
pub const EXAMPLE_END: &str = "<EXAMPLE_END>";

pub const SCRUBBED_MARKERS: [&str; 9] = [
    "<bos>",
    "<eos>",
    "<pad>",
    "<start_of_turn>",
    "<end_of_turn>",
    EXAMPLE_START,
    EXAMPLE_END,
    "**INSTRUCTIONS:**",
    "**STORY IDEA:**",
];

const ROLE_WORDS: [&str; 2] = ["user", "model"];

/// Lines with this many whitespace-separated tokens or fewer are noise.
const MIN_LINE_TOKENS: usize = 5;

const TERMINAL_PUNCTUATION: [char; 10] = ['.', '!', '?', '"', '\'', '।', '॥', '”', '’', '…'];

pub const DEFAULT_MIN_STORY_CHARS: usize = 50;

/// A finished story. Only the sanitizer builds one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CleanedStory(String);

impl CleanedStory {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CleanedStory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("cleaned story has {chars} characters, more than {min} required")]
    TooShort { chars: usize, min: usize },
}

pub fn isolate_model_turn(text: &str) -> &str {
    let text = text.trim();
    match text.rfind(MODEL_TURN_MARKER) {
        Some(index) => text[index + MODEL_TURN_MARKER.len()..].trim(),
        None => text,
    }
}

pub fn truncate_at_demonstration(text: &str) -> &str {
    let text = text.split(EXAMPLE_START).next().unwrap_or_default().trim();
    text.split(EXAMPLE_END).next().unwrap_or_default().trim()
}

pub fn scrub_markers(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let mut next = current.clone();
        for marker in SCRUBBED_MARKERS {
            next = next.replace(marker, "");
        }
        for word in ROLE_WORDS {
            next = remove_whole_word(&next, word);
        }
        if next == current {
            return next.trim().to_string();
        }
        current = next;
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Removes every whole-word occurrence of `word`, with the spaces or tabs before it.
fn remove_whole_word(text: &str, word: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut prev: Option<char> = None;

    while let Some(c) = rest.chars().next() {
        let starts_word = prev.is_none_or(|p| !is_word_char(p));
        if starts_word && rest.starts_with(word) {
            let after = &rest[word.len()..];
            if after.chars().next().is_none_or(|n| !is_word_char(n)) {
                let kept = out.trim_end_matches([' ', '\t']).len();
                out.truncate(kept);
                prev = word.chars().last();
                rest = after;
                continue;
            }
        }
        out.push(c);
        prev = Some(c);
        rest = &rest[c.len_utf8()..];
    }

    out
}

pub fn reflow_lines(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| line.split_whitespace().count() > MIN_LINE_TOKENS)
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn ensure_terminal_punctuation(text: &str) -> String {
    match text.chars().last() {
        Some(last) if !TERMINAL_PUNCTUATION.contains(&last) => format!("{text}."),
        _ => text.to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OutputSanitizer {
    min_story_chars: usize,
}

impl Default for OutputSanitizer {
    fn default() -> Self {
        OutputSanitizer::new(DEFAULT_MIN_STORY_CHARS)
    }
}

impl OutputSanitizer {
    pub fn new(min_story_chars: usize) -> Self {
        OutputSanitizer { min_story_chars }
    }

    /// Runs every cleaning stage. Applying it to its own output changes nothing.
    pub fn clean(&self, raw: &str) -> String {
        let text = isolate_model_turn(raw);
        let text = truncate_at_demonstration(text);
        let text = scrub_markers(text);
        let text = reflow_lines(&text);
        ensure_terminal_punctuation(&text)
    }

    pub fn finish(&self, raw: &str) -> Result<CleanedStory, SanitizeError> {
        let cleaned = self.clean(raw);
        let chars = cleaned.trim().chars().count();
        if chars <= self.min_story_chars {
            return Err(SanitizeError::TooShort { chars, min: self.min_story_chars });
        }
        Ok(CleanedStory(cleaned))
    }
}
