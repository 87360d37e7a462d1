//! Stream event types shared by every transport and the session store.
//!
//! This module defines the contract for events emitted during a request.
//! Events are serializable so callers can forward them as JSON lines.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of a single unit of live progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    /// Partial or final assistant text.
    Text,
    /// Reasoning emitted before or between answers.
    Thinking,
    /// The backend invoked a tool.
    ToolUse,
    /// A tool invocation returned.
    ToolResult,
    /// Lifecycle progress without user-facing text (init, percentages).
    Progress,
    /// The request finished successfully.
    Complete,
    /// The request failed.
    Error,
}

impl StreamEventKind {
    /// Returns true for `Complete` and `Error`.
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamEventKind::Complete | StreamEventKind::Error)
    }
}

impl fmt::Display for StreamEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamEventKind::Text => write!(f, "text"),
            StreamEventKind::Thinking => write!(f, "thinking"),
            StreamEventKind::ToolUse => write!(f, "tool_use"),
            StreamEventKind::ToolResult => write!(f, "tool_result"),
            StreamEventKind::Progress => write!(f, "progress"),
            StreamEventKind::Complete => write!(f, "complete"),
            StreamEventKind::Error => write!(f, "error"),
        }
    }
}

/// Token usage counters reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Input tokens (non-cached)
    #[serde(default)]
    pub input_tokens: u64,
    /// Output tokens
    #[serde(default)]
    pub output_tokens: u64,
    /// Tokens read from cache
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    /// Tokens written to cache
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl Usage {
    /// Returns true if all fields are zero.
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_read_input_tokens == 0
            && self.cache_creation_input_tokens == 0
    }

    /// Total tokens across all counters.
    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_read_input_tokens
            + self.cache_creation_input_tokens
    }
}

impl std::ops::Add for Usage {
    type Output = Usage;

    fn add(self, other: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            cache_read_input_tokens: self.cache_read_input_tokens + other.cache_read_input_tokens,
            cache_creation_input_tokens: self.cache_creation_input_tokens
                + other.cache_creation_input_tokens,
        }
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, other: Usage) {
        *self = *self + other;
    }
}

/// Optional structured data attached to an event.
///
/// Additive only: unknown keys land in `extra` and are carried through
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    /// Fraction in `0.0..=1.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Target path of a file-writing tool use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Language inferred from `file_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    /// Marks the text event carrying the backend's full final result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_result: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One normalized unit of progress for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
}

impl StreamEvent {
    /// Creates an event with no metadata.
    pub fn new(kind: StreamEventKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(StreamEventKind::Text, content)
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self::new(StreamEventKind::Thinking, content)
    }

    pub fn complete() -> Self {
        Self::new(StreamEventKind::Complete, "")
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(StreamEventKind::Error, message)
    }

    /// Creates a progress event; the fraction is clamped to `0.0..=1.0`.
    pub fn progress(content: impl Into<String>, fraction: Option<f32>) -> Self {
        let mut event = Self::new(StreamEventKind::Progress, content);
        if let Some(fraction) = fraction {
            event.metadata_mut().progress = Some(clamp_progress(fraction));
        }
        event
    }

    /// Attaches metadata, replacing any existing value.
    #[must_use]
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Returns the metadata, creating an empty map on first access.
    pub fn metadata_mut(&mut self) -> &mut EventMetadata {
        self.metadata.get_or_insert_with(EventMetadata::default)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// Progress fraction carried by this event, if any.
    pub fn progress_value(&self) -> Option<f32> {
        self.metadata.as_ref().and_then(|m| m.progress)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.session_id.as_deref())
    }

    pub fn is_final_result(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.final_result)
            .unwrap_or(false)
    }
}

fn clamp_progress(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
