//! Closing-phrase detection on finalized user utterances

use serde::{Deserialize, Serialize};

use super::normalize::normalize;

/// How a configured phrase is compared against an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// The whole utterance must equal the phrase
    Exact,
    /// The phrase may appear anywhere in the utterance
    #[default]
    Contains,
}

/// Matches finalized transcripts against the configured closing phrases
#[derive(Debug, Clone)]
pub struct TerminationDetector {
    /// (configured phrase, normalized phrase), in configuration order
    phrases: Vec<(String, String)>,
    mode: MatchMode,
}

impl TerminationDetector {
    pub fn new<S: AsRef<str>>(phrases: &[S], mode: MatchMode) -> Self {
        let phrases = phrases
            .iter()
            .map(|p| (p.as_ref().to_string(), normalize(p.as_ref())))
            .filter(|(_, normalized)| !normalized.is_empty())
            .collect();

        Self { phrases, mode }
    }

    /// Return the first configured phrase matching `text`, if any.
    pub fn detect(&self, text: &str) -> Option<&str> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return None;
        }

        self.phrases
            .iter()
            .find(|(_, phrase)| match self.mode {
                MatchMode::Exact => normalized == *phrase,
                MatchMode::Contains => normalized.contains(phrase.as_str()),
            })
            .map(|(original, _)| original.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }
}
