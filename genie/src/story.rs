use crate::request::{GenerationRequest, Genre, Language};
use crate::sanitizer::CleanedStory;
use chrono::{DateTime, Utc};
use serde::Serialize;

const TITLE_WORDS: usize = 6;

/// A generated story ready to be stored alongside its request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoryDraft {
    pub title: String,
    pub content: CleanedStory,
    pub word_count: usize,
    pub language: Language,
    pub genre: Genre,
    pub generated_at: DateTime<Utc>,
}

impl StoryDraft {
    pub fn new(request: &GenerationRequest, content: CleanedStory) -> Self {
        StoryDraft {
            title: title_from_prompt(&request.prompt),
            word_count: content.as_str().split_whitespace().count(),
            content,
            language: request.language.clone(),
            genre: request.genre,
            generated_at: Utc::now(),
        }
    }
}

pub fn title_from_prompt(prompt: &str) -> String {
    let words: Vec<&str> = prompt.split_whitespace().collect();
    let mut title = words.iter().take(TITLE_WORDS).copied().collect::<Vec<_>>().join(" ");
    if words.len() > TITLE_WORDS {
        title.push_str("...");
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::LengthClass;
    use crate::sanitizer::OutputSanitizer;

    #[test]
    fn test_title_from_prompt() {
        assert_eq!(title_from_prompt("A dragon meets a knight"), "A dragon meets a knight");
        assert_eq!(
            title_from_prompt("A dragon   meets a knight at the old bridge"),
            "A dragon meets a knight at..."
        );
        assert_eq!(title_from_prompt("one two three four five six"), "one two three four five six");
    }

    #[test]
    fn test_draft_counts_words() {
        let request = GenerationRequest::new(
            "A dragon meets a knight",
            Genre::Fantasy,
            Language::English,
            LengthClass::Short,
        );
        let story = OutputSanitizer::default()
            .finish("The dragon bowed low before the knight.\nThe knight laughed and sheathed his sword")
            .unwrap();

        let draft = StoryDraft::new(&request, story);

        assert_eq!(draft.word_count, 14);
        assert_eq!(draft.title, "A dragon meets a knight");

        let json = serde_json::to_value(&draft).unwrap();
        assert_eq!(json["language"], "en");
        assert_eq!(json["genre"], "fantasy");
        assert!(json["content"].as_str().unwrap().ends_with("sword."));
    }
}
