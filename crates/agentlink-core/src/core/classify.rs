//! Thinking-vs-text classification for unstructured backend output.
//!
//! Backends that print free text interleave their reasoning with the answer.
//! The cue lists below are a best-effort policy; they can be replaced through
//! the `[heuristics]` config section.

use serde::{Deserialize, Serialize};

use crate::core::events::StreamEventKind;

const DEFAULT_PREFIXES: &[&str] = &[
    "🤔", "💭", "🧠", "🔍", "🔎", "💡", "⏳", "📋", "...", "…",
];

const DEFAULT_PHRASES: &[&str] = &[
    "let me",
    "let's",
    "first i",
    "first, i",
    "first let me",
    "analyzing",
    "analysing",
    "thinking",
    "i need to",
    "i'll start by",
    "i will start by",
    "looking at",
    "checking",
    "now i",
    "next, i",
    // zh
    "让我",
    "首先",
    "我需要",
    "正在分析",
    "分析",
    "思考",
    // ja
    "まず",
    "確認します",
    // es / fr / de
    "déjame",
    "primero",
    "analizando",
    "laissez-moi",
    "d'abord",
    "lass mich",
    "zuerst",
];

/// Classifies free-text lines as thinking or plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThinkingClassifier {
    /// Leading markers (emoji, ellipsis) matched against the trimmed line.
    pub thinking_prefixes: Vec<String>,
    /// Opening phrases matched case-insensitively at the start of the line.
    pub thinking_phrases: Vec<String>,
}

impl Default for ThinkingClassifier {
    fn default() -> Self {
        Self {
            thinking_prefixes: DEFAULT_PREFIXES.iter().map(ToString::to_string).collect(),
            thinking_phrases: DEFAULT_PHRASES.iter().map(ToString::to_string).collect(),
        }
    }
}

impl ThinkingClassifier {
    /// Returns `Thinking` when the line opens with a reasoning cue, else `Text`.
    pub fn classify(&self, line: &str) -> StreamEventKind {
        if self.is_thinking(line) {
            StreamEventKind::Thinking
        } else {
            StreamEventKind::Text
        }
    }

    pub fn is_thinking(&self, line: &str) -> bool {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            return false;
        }

        if self
            .thinking_prefixes
            .iter()
            .any(|p| !p.is_empty() && trimmed.starts_with(p.as_str()))
        {
            return true;
        }

        let lowered = trimmed.to_lowercase();
        self.thinking_phrases.iter().any(|phrase| {
            let phrase = phrase.to_lowercase();
            !phrase.is_empty() && starts_with_word(&lowered, &phrase)
        })
    }
}

/// Matches `phrase` at the start of `text`, requiring a word boundary after
/// ASCII phrases so "letter" does not match "let".
fn starts_with_word(text: &str, phrase: &str) -> bool {
    let Some(rest) = text.strip_prefix(phrase) else {
        return false;
    };
    if !phrase.is_ascii() {
        return true;
    }
    rest.chars()
        .next()
        .is_none_or(|c| !c.is_alphanumeric())
}
