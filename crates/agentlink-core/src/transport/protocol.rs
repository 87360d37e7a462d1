//! Backend-native message shapes and their mapping to `StreamEvent`s.
//!
//! Both transports speak the same line-structured protocol: the subprocess
//! prints one JSON object per line, the direct backend yields the same
//! objects in-process. The mapping rules live here so the two stay in sync.
//!
//! ```jsonl
//! {"type":"system","subtype":"init","session_id":"…","model":"…"}
//! {"type":"assistant","message":{"content":[{"type":"text","text":"…"}]}}
//! {"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"…","content":"…"}]}}
//! {"type":"result","subtype":"success","result":"Done.","usage":{…}}
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::events::{EventMetadata, StreamEvent, StreamEventKind, Usage};

/// Maximum characters of a tool result echoed into an event.
const TOOL_RESULT_PREVIEW_CHARS: usize = 2000;

/// One typed content block inside an assistant or user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

/// Message body of `assistant` and `user` lines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Content is either a bare string or an ordered block list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Blocks(Vec::new())
    }
}

impl MessageContent {
    /// Returns the content as blocks (a bare string becomes one text block).
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match self {
            MessageContent::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
            MessageContent::Blocks(blocks) => blocks.clone(),
        }
    }
}

/// A backend-native message with a recognized `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendMessage {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    Assistant {
        #[serde(default)]
        message: MessageBody,
        #[serde(default)]
        session_id: Option<String>,
    },
    User {
        #[serde(default)]
        message: MessageBody,
        #[serde(default)]
        session_id: Option<String>,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },
    Error {
        #[serde(default)]
        error: Option<Value>,
        #[serde(default)]
        message: Option<String>,
    },
    /// Typed reasoning chunk (direct backends only).
    Thinking {
        #[serde(default, alias = "thinking")]
        content: String,
    },
    /// Typed progress update (direct backends only).
    Progress {
        #[serde(default)]
        progress: Option<f32>,
        #[serde(default)]
        message: Option<String>,
    },
}

impl BackendMessage {
    /// Parses one line strictly: it must be a JSON object with a known `type`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    /// Maps this message to zero or more events, in order.
    pub fn into_events(self) -> Vec<StreamEvent> {
        match self {
            BackendMessage::System {
                subtype,
                session_id,
                model,
                cwd,
            } => {
                let subtype = subtype.unwrap_or_default();
                if subtype != "init" {
                    return Vec::new();
                }
                let content = match &model {
                    Some(model) => format!("Session initialized ({model})"),
                    None => "Session initialized".to_string(),
                };
                let mut event = StreamEvent::progress(content, Some(0.0));
                let meta = event.metadata_mut();
                meta.session_id = session_id;
                if let Some(model) = model {
                    meta.extra.insert("model".to_string(), Value::String(model));
                }
                if let Some(cwd) = cwd {
                    meta.extra.insert("cwd".to_string(), Value::String(cwd));
                }
                vec![event]
            }
            BackendMessage::Assistant {
                message,
                session_id,
            } => {
                let usage = message.usage;
                let mut events: Vec<StreamEvent> = message
                    .content
                    .blocks()
                    .into_iter()
                    .filter_map(assistant_block_event)
                    .collect();
                for event in &mut events {
                    if session_id.is_some() {
                        event.metadata_mut().session_id.clone_from(&session_id);
                    }
                }
                if let (Some(usage), Some(last)) = (usage, events.last_mut())
                    && !usage.is_empty()
                {
                    last.metadata_mut().usage = Some(usage);
                }
                events
            }
            BackendMessage::User { message, .. } => message
                .content
                .blocks()
                .into_iter()
                .filter_map(tool_result_event)
                .collect(),
            BackendMessage::Result {
                subtype,
                result,
                is_error,
                session_id,
                usage,
                duration_ms,
                total_cost_usd,
            } => {
                let success = !is_error && subtype.as_deref().is_none_or(|s| s == "success");
                if !success {
                    let message = result
                        .filter(|r| !r.trim().is_empty())
                        .unwrap_or_else(|| {
                            format!(
                                "Backend reported failure ({})",
                                subtype.as_deref().unwrap_or("error")
                            )
                        });
                    let mut event = StreamEvent::error(message);
                    event.metadata_mut().session_id = session_id;
                    event.metadata_mut().is_error = Some(true);
                    return vec![event];
                }

                let mut events = Vec::with_capacity(2);
                if let Some(result) = result {
                    let mut text = StreamEvent::text(result);
                    let meta = text.metadata_mut();
                    meta.final_result = Some(true);
                    meta.session_id.clone_from(&session_id);
                    events.push(text);
                }

                let mut complete = StreamEvent::complete();
                let meta = complete.metadata_mut();
                meta.session_id = session_id;
                meta.usage = usage;
                meta.progress = Some(1.0);
                if let Some(ms) = duration_ms {
                    meta.extra.insert("duration_ms".to_string(), Value::from(ms));
                }
                if let Some(cost) = total_cost_usd {
                    meta.extra.insert("total_cost_usd".to_string(), Value::from(cost));
                }
                events.push(complete);
                events
            }
            BackendMessage::Error { error, message } => {
                let text = message
                    .or_else(|| error.as_ref().map(error_text))
                    .unwrap_or_else(|| "Backend error".to_string());
                vec![StreamEvent::error(text)]
            }
            BackendMessage::Thinking { content } => {
                if content.is_empty() {
                    Vec::new()
                } else {
                    vec![StreamEvent::thinking(content)]
                }
            }
            BackendMessage::Progress { progress, message } => {
                vec![StreamEvent::progress(message.unwrap_or_default(), progress)]
            }
        }
    }
}

fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), ToString::to_string),
        other => other.to_string(),
    }
}

fn assistant_block_event(block: ContentBlock) -> Option<StreamEvent> {
    match block {
        ContentBlock::Text { text } if !text.is_empty() => Some(StreamEvent::text(text)),
        ContentBlock::Thinking { thinking } if !thinking.is_empty() => {
            Some(StreamEvent::thinking(thinking))
        }
        ContentBlock::ToolUse { id, name, input } => Some(tool_use_event(id, name, input)),
        _ => None,
    }
}

fn tool_result_event(block: ContentBlock) -> Option<StreamEvent> {
    let ContentBlock::ToolResult {
        tool_use_id,
        content,
        is_error,
    } = block
    else {
        return None;
    };
    let text = truncate_chars(&tool_result_text(&content), TOOL_RESULT_PREVIEW_CHARS);
    let mut event = StreamEvent::new(StreamEventKind::ToolResult, text);
    let meta = event.metadata_mut();
    meta.tool_use_id = tool_use_id;
    meta.is_error = Some(is_error);
    Some(event)
}

/// Flattens a tool result payload (string or list of text blocks) to text.
pub fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(obj) => obj.get("text").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Builds a `tool_use` event. File-writing tools surface the target path and
/// language and embed the written content as a fenced block.
pub fn tool_use_event(id: Option<String>, name: String, input: Value) -> StreamEvent {
    let mut metadata = EventMetadata {
        tool_name: Some(name.clone()),
        tool_use_id: id,
        ..EventMetadata::default()
    };

    let content = match file_write_target(&name, &input) {
        Some((path, body)) => {
            let language = language_for_path(&path);
            let fence = language.unwrap_or("");
            let content = format!("Writing {path}\n```{fence}\n{body}\n```\n");
            metadata.file_path = Some(path);
            metadata.language = language.map(str::to_string);
            content
        }
        None => format!("[Tool: {name}] {}\n", summarize_input(&input)),
    };
    metadata.tool_input = Some(input);

    StreamEvent::new(StreamEventKind::ToolUse, content).with_metadata(metadata)
}

/// Returns `(path, written_content)` for tool uses that write a file.
fn file_write_target(name: &str, input: &Value) -> Option<(String, String)> {
    let path = input
        .get("file_path")
        .or_else(|| input.get("path"))
        .or_else(|| input.get("notebook_path"))
        .and_then(Value::as_str)?
        .to_string();

    let body = match name {
        "Write" | "write_file" | "create_file" => input.get("content")?.as_str()?.to_string(),
        "Edit" | "str_replace" => input.get("new_string")?.as_str()?.to_string(),
        "MultiEdit" => input
            .get("edits")?
            .as_array()?
            .iter()
            .filter_map(|e| e.get("new_string").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        "NotebookEdit" => input.get("new_source")?.as_str()?.to_string(),
        _ => return None,
    };
    Some((path, body))
}

/// Compact single-line JSON summary of tool parameters.
pub fn summarize_input(input: &Value) -> String {
    match input {
        Value::Null => "{}".to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Infers a fenced-block language tag from a file extension.
pub fn language_for_path(path: &str) -> Option<&'static str> {
    let file_name = Path::new(path).file_name()?.to_str()?;
    match file_name {
        "Dockerfile" => return Some("dockerfile"),
        "Makefile" => return Some("makefile"),
        _ => {}
    }
    let ext = Path::new(file_name).extension()?.to_str()?.to_ascii_lowercase();
    let language = match ext.as_str() {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" => "typescript",
        "tsx" => "tsx",
        "jsx" => "jsx",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "sh" | "bash" | "zsh" => "bash",
        "json" => "json",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "md" | "markdown" => "markdown",
        "html" | "htm" => "html",
        "css" => "css",
        "scss" => "scss",
        "sql" => "sql",
        "xml" => "xml",
        "lua" => "lua",
        _ => return None,
    };
    Some(language)
}

/// Truncates to at most `max_chars` characters, appending "…" when cut.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
