//! Transcript entries: the append-only JSONL the backend writes per session.
//!
//! Two line shapes are accepted:
//!
//! ```jsonl
//! {"role":"user","content":"Fix it","timestamp":"2025-01-01T00:00:00Z","sessionId":"s1"}
//! {"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Done"}]},"uuid":"…"}
//! ```
//!
//! Entries without a recognizable role (summaries, snapshots) still count as
//! entries for status and timestamps but produce no message.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::core::session::{
    Message, MessageMetadata, Role, Session, SessionStatus, ToolCall, derive_title,
};
use crate::transport::protocol::{
    ContentBlock, MessageContent, summarize_input, tool_result_text, truncate_chars,
};

/// Maximum characters of a tool result kept in rendered message content.
const RESULT_SUMMARY_CHARS: usize = 500;

#[derive(Debug, Clone, Default, Deserialize)]
struct NestedMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<MessageContent>,
}

/// One parsed transcript line.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    #[serde(default, rename = "type")]
    entry_type: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<MessageContent>,
    #[serde(default)]
    message: Option<NestedMessage>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub tool_use_result: Option<Value>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
}

impl TranscriptEntry {
    /// Parses one line; returns `None` for blank lines and anything that is
    /// not a JSON object.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    /// Role from the top level, the nested message, or the entry type.
    pub fn role(&self) -> Option<Role> {
        self.role
            .as_deref()
            .or_else(|| self.message.as_ref().and_then(|m| m.role.as_deref()))
            .or(self.entry_type.as_deref())
            .and_then(Role::parse)
    }

    fn content(&self) -> Option<&MessageContent> {
        self.content
            .as_ref()
            .or_else(|| self.message.as_ref().and_then(|m| m.content.as_ref()))
    }

    /// Accepts RFC 3339 strings and epoch milliseconds.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self.timestamp.as_ref()? {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            Value::Number(n) => n
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            _ => None,
        }
    }

    /// Renders content blocks to display text.
    pub fn rendered_content(&self) -> String {
        self.content().map(render_content).unwrap_or_default()
    }

    fn tool_calls(&self) -> Vec<ToolCall> {
        let Some(MessageContent::Blocks(blocks)) = self.content() else {
            return Vec::new();
        };
        blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Builds the normalized message, or `None` for entries without a role.
    pub fn to_message(&self, fallback_id: String, fallback_time: DateTime<Utc>) -> Option<Message> {
        let role = self.role()?;

        let mut metadata = MessageMetadata {
            tool_calls: self.tool_calls(),
            session_id: self.session_id.clone(),
            request_id: self.request_id.clone(),
            ..MessageMetadata::default()
        };
        if let Some(result) = &self.tool_use_result {
            metadata
                .extra
                .insert("tool_use_result".to_string(), result.clone());
        }

        Some(Message {
            id: self.uuid.clone().unwrap_or(fallback_id),
            role,
            content: self.rendered_content(),
            timestamp: self.timestamp().unwrap_or(fallback_time),
            files: Vec::new(),
            metadata,
        })
    }
}

/// Concatenates content blocks in order.
///
/// Text is kept verbatim, tool uses and results become labeled summaries,
/// thinking is dropped.
pub fn render_content(content: &MessageContent) -> String {
    let blocks = match content {
        MessageContent::Text(text) => return text.clone(),
        MessageContent::Blocks(blocks) => blocks,
    };

    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.clone()),
            ContentBlock::ToolUse { name, input, .. } => {
                Some(format!("[Tool: {name}] {}", summarize_input(input)))
            }
            ContentBlock::ToolResult {
                content, is_error, ..
            } => {
                let label = if *is_error {
                    "Tool error"
                } else {
                    "Tool result"
                };
                let text = truncate_chars(&tool_result_text(content), RESULT_SUMMARY_CHARS);
                Some(format!("[{label}] {text}"))
            }
            ContentBlock::Thinking { .. } | ContentBlock::Other => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Reconstructs a session from its transcript entries.
///
/// Returns `None` when there are no entries. `file_time` stands in for
/// missing timestamps.
pub fn session_from_entries(
    id: &str,
    entries: &[TranscriptEntry],
    file_time: DateTime<Utc>,
) -> Option<Session> {
    let last = entries.last()?;

    let mut session = Session::with_id(id);
    let mut previous = entries
        .iter()
        .find_map(TranscriptEntry::timestamp)
        .unwrap_or(file_time);
    session.created_at = previous;
    session.updated_at = previous;

    for (index, entry) in entries.iter().enumerate() {
        let at = entry.timestamp().unwrap_or(previous);
        if let Some(message) = entry.to_message(format!("{id}-{index}"), at) {
            session.append(message);
        }
        previous = previous.max(at);
    }

    session.updated_at = entries
        .iter()
        .rev()
        .find_map(TranscriptEntry::timestamp)
        .unwrap_or(file_time)
        .max(session.created_at);
    session.status = match last.role() {
        Some(Role::User) => SessionStatus::Pending,
        _ => SessionStatus::Completed,
    };
    session.title = derive_title(session.first_user_message().map(|m| m.content.as_str()));

    let meta = &mut session.metadata;
    meta.backend_session_id = entries.iter().find_map(|e| e.session_id.clone());
    meta.cwd = entries.iter().rev().find_map(|e| e.cwd.clone());
    meta.version = entries.iter().rev().find_map(|e| e.version.clone());
    meta.git_branch = entries.iter().rev().find_map(|e| e.git_branch.clone());

    Some(session)
}

/// Formats a session in a human-readable transcript.
pub fn format_transcript(session: &Session) -> String {
    let mut output = format!("### {}\n\n", session.title);

    for message in &session.messages {
        let label = match message.role {
            Role::User => "You",
            Role::Assistant => "Assistant",
        };
        output.push_str(&format!("### {label}\n"));
        output.push_str(&message.content);
        if message.metadata.cancelled {
            output.push_str("\n(interrupted)");
        }
        output.push_str("\n\n");
    }

    output.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn parse_all(lines: &[&str]) -> Vec<TranscriptEntry> {
        lines.iter().filter_map(|l| TranscriptEntry::parse(l)).collect()
    }

    #[test]
    fn parses_flat_and_nested_shapes() {
        let flat = TranscriptEntry::parse(r#"{"role":"user","content":"hello"}"#).unwrap();
        assert_eq!(flat.role(), Some(Role::User));
        assert_eq!(flat.rendered_content(), "hello");

        let nested = TranscriptEntry::parse(
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"hi"}]},"gitBranch":"main"}"#,
        )
        .unwrap();
        assert_eq!(nested.role(), Some(Role::Assistant));
        assert_eq!(nested.rendered_content(), "hi");
        assert_eq!(nested.git_branch.as_deref(), Some("main"));
    }

    #[test]
    fn rejects_non_objects() {
        assert!(TranscriptEntry::parse("").is_none());
        assert!(TranscriptEntry::parse("not json").is_none());
        assert!(TranscriptEntry::parse(r#"{"role": "user""#).is_none());
    }

    #[test]
    fn renders_blocks_in_order_and_skips_thinking() {
        let entry = TranscriptEntry::parse(
            r#"{"role":"assistant","content":[
                {"type":"thinking","thinking":"hmm"},
                {"type":"text","text":"Reading."},
                {"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"a.rs"}},
                {"type":"tool_result","tool_use_id":"t1","content":"ok"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(
            entry.rendered_content(),
            "Reading.\n[Tool: Read] {\"file_path\":\"a.rs\"}\n[Tool result] ok"
        );
        let message = entry.to_message("x".to_string(), at(0)).unwrap();
        assert_eq!(message.metadata.tool_calls.len(), 1);
        assert_eq!(message.metadata.tool_calls[0].name, "Read");
    }

    #[test]
    fn timestamps_accept_rfc3339_and_millis() {
        let rfc = TranscriptEntry::parse(r#"{"timestamp":"1970-01-01T00:01:40Z"}"#).unwrap();
        assert_eq!(rfc.timestamp(), Some(at(100)));
        let millis = TranscriptEntry::parse(r#"{"timestamp":100000}"#).unwrap();
        assert_eq!(millis.timestamp(), Some(at(100)));
    }

    #[test]
    fn session_status_follows_last_entry() {
        let entries = parse_all(&[
            r#"{"role":"user","content":"a","timestamp":"1970-01-01T00:00:10Z"}"#,
            r#"{"role":"assistant","content":"b","timestamp":"1970-01-01T00:00:20Z"}"#,
            r#"{"role":"user","content":"c","timestamp":"1970-01-01T00:00:30Z"}"#,
        ]);
        let session = session_from_entries("s1", &entries, at(0)).unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.messages.len(), 3);
        assert_eq!(session.created_at, at(10));
        assert_eq!(session.updated_at, at(30));
        assert_eq!(session.title, "a");

        let done = session_from_entries("s1", &entries[..2], at(0)).unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
    }

    #[test]
    fn roleless_entries_count_for_status_only() {
        let entries = parse_all(&[
            r#"{"role":"user","content":"a"}"#,
            r#"{"type":"summary","summary":"x"}"#,
        ]);
        let session = session_from_entries("s1", &entries, at(5)).unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.created_at, at(5));
    }

    #[test]
    fn empty_entries_yield_no_session() {
        assert!(session_from_entries("s1", &[], at(0)).is_none());
    }

    #[test]
    fn metadata_comes_from_entries() {
        let entries = parse_all(&[
            r#"{"role":"user","content":"a","sessionId":"backend-1","cwd":"/w","version":"1.0.3"}"#,
        ]);
        let session = session_from_entries("s1", &entries, at(0)).unwrap();
        assert_eq!(
            session.metadata.backend_session_id.as_deref(),
            Some("backend-1")
        );
        assert_eq!(session.metadata.cwd.as_deref(), Some("/w"));
        assert_eq!(session.metadata.version.as_deref(), Some("1.0.3"));
    }

    #[test]
    fn transcript_lists_messages_by_role() {
        let mut session = Session::with_id("s1");
        session.append(Message::user("hello"));
        session.append(Message::assistant("hi there"));
        let text = format_transcript(&session);
        assert!(text.starts_with("### hello"));
        assert!(text.contains("### You\nhello"));
        assert!(text.contains("### Assistant\nhi there"));
    }
}
