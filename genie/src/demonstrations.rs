//! Few-shot transcripts bundled with the binary.

use crate::request::{Genre, Language};

pub const DEFAULT_KEY: &str = "en_fantasy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemonstrationExample {
    pub key: &'static str,
    pub transcript: &'static str,
}

static BUNDLED: [DemonstrationExample; 3] = [
    DemonstrationExample {
        key: "hi_mystery",
        transcript: include_str!("../demonstrations/hi_mystery.txt"),
    },
    DemonstrationExample {
        key: "te_comedy",
        transcript: include_str!("../demonstrations/te_comedy.txt"),
    },
    DemonstrationExample {
        key: DEFAULT_KEY,
        transcript: include_str!("../demonstrations/en_fantasy.txt"),
    },
];

pub fn demonstration_key(language: &Language, genre: Genre) -> String {
    format!("{}_{}", language.code(), genre.as_str()).to_lowercase()
}

#[derive(Debug, Clone, Copy)]
pub struct DemonstrationBank {
    entries: &'static [DemonstrationExample],
    default: &'static DemonstrationExample,
}

impl Default for DemonstrationBank {
    fn default() -> Self {
        DemonstrationBank {
            entries: &BUNDLED,
            default: &BUNDLED[2],
        }
    }
}

impl DemonstrationBank {
    pub fn lookup(&self, language: &Language, genre: Genre) -> Option<&'static DemonstrationExample> {
        let key = demonstration_key(language, genre);
        self.entries.iter().find(|example| example.key == key)
    }

    /// The exact match, or the default transcript.
    pub fn select(&self, language: &Language, genre: Genre) -> &'static DemonstrationExample {
        self.lookup(language, genre).unwrap_or(self.default)
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|example| example.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let bank = DemonstrationBank::default();
        let example = bank.select(&Language::Telugu, Genre::Comedy);

        assert_eq!(example.key, "te_comedy");
        assert!(example.transcript.contains("**COMEDY**"));
    }

    #[test]
    fn test_missing_pair_falls_back_to_default() {
        let bank = DemonstrationBank::default();

        assert!(bank.lookup(&Language::Hindi, Genre::Horror).is_none());
        assert_eq!(bank.select(&Language::Hindi, Genre::Horror).key, DEFAULT_KEY);
        assert_eq!(bank.select(&Language::Other("fr".into()), Genre::Fantasy).key, DEFAULT_KEY);
    }

    #[test]
    fn test_key_uses_wire_strings() {
        assert_eq!(demonstration_key(&Language::English, Genre::SciFi), "en_sci-fi");
        assert_eq!(demonstration_key(&Language::Other("FR".into()), Genre::Mystery), "fr_mystery");
    }

    #[test]
    fn test_transcripts_are_complete_turns() {
        let bank = DemonstrationBank::default();
        assert_eq!(bank.keys().count(), 3);

        for key in bank.keys() {
            let example = bank.entries.iter().find(|e| e.key == key).unwrap();
            assert!(example.transcript.starts_with("<start_of_turn>user\n**INSTRUCTIONS:** "));
            assert!(example.transcript.contains("<end_of_turn>\n<start_of_turn>model\n"));
            assert!(example.transcript.ends_with('\n'));
        }
    }
}
