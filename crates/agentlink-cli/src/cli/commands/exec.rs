//! Exec and probe command handlers.
//!
//! # Output contract
//! - assistant text → stdout
//! - thinking, tool activity, progress and the session id → stderr
//! - `--json`: every stream event as one JSON line on stdout

use std::io::{Write, stderr, stdout};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use agentlink_core::config::Config;
use agentlink_core::core::events::{StreamEvent, StreamEventKind};
use agentlink_core::core::interrupt;
use agentlink_core::core::manager::{RequestOutcome, SessionManager};
use agentlink_core::core::session::Message;
use agentlink_core::core::sink::EventSink;
use anyhow::{Context, Result};
use tracing::debug;

use super::resolve_root;

pub struct ExecRunOptions<'a> {
    pub root: &'a Path,
    pub prompt: &'a str,
    pub session: Option<&'a str>,
    pub json: bool,
    pub config: &'a Config,
}

pub async fn run(options: ExecRunOptions<'_>) -> Result<()> {
    let root = resolve_root(options.root)?;
    let manager = SessionManager::from_config(options.config, root, None);
    let mode = manager.initialize().await;
    debug!(%mode, "Transport selected");

    let renderer = Arc::new(ExecRenderer::new(options.json));
    if let Some(id) = options.session {
        manager
            .resume_session(id, renderer.as_ref())
            .with_context(|| format!("resume session '{id}'"))?;
    }

    let handle = manager
        .send_streaming(options.prompt, Arc::clone(&renderer) as Arc<dyn EventSink>)
        .context("start request")?;
    let watcher = interrupt::cancel_on_interrupt(handle.cancellation_token());
    let outcome = handle.wait().await;
    watcher.abort();

    if let Some(session) = manager.active_session() {
        let _ = writeln!(stderr(), "Session: {}", session.id);
    }

    match outcome {
        RequestOutcome::Completed(_) => Ok(()),
        RequestOutcome::Cancelled(_) => Err(interrupt::InterruptedError.into()),
        RequestOutcome::Failed(error) => anyhow::bail!(error),
    }
}

pub async fn probe(root: &Path, config: &Config) -> Result<()> {
    let root = resolve_root(root)?;
    let manager = SessionManager::from_config(config, root, None);
    let mode = manager.initialize().await;
    println!("{mode}");
    Ok(())
}

#[derive(Debug, Default)]
struct RenderState {
    /// Assistant text was printed without a trailing newline.
    needs_final_newline: bool,
    printed_text: bool,
}

/// Writes request events to stdout/stderr.
#[derive(Debug)]
struct ExecRenderer {
    json: bool,
    state: Mutex<RenderState>,
}

impl ExecRenderer {
    fn new(json: bool) -> Self {
        Self {
            json,
            state: Mutex::new(RenderState::default()),
        }
    }

    fn render_json(event: &StreamEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let mut out = stdout();
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
    }

    fn render_text(state: &mut RenderState, event: &StreamEvent) {
        // the final result repeats streamed text
        if event.is_final_result() && state.printed_text {
            return;
        }
        if event.content.is_empty() {
            return;
        }
        let mut out = stdout();
        let _ = write!(out, "{}", event.content);
        let _ = out.flush();
        state.printed_text = true;
        state.needs_final_newline = !event.content.ends_with('\n');
    }

    fn render_status(state: &mut RenderState, prefix: &str, content: &str) {
        let content = content.trim_end();
        if content.is_empty() {
            return;
        }
        if state.needs_final_newline {
            let _ = writeln!(stdout());
            state.needs_final_newline = false;
        }
        let _ = writeln!(stderr(), "{prefix}{content}");
    }
}

impl EventSink for ExecRenderer {
    fn on_event(&self, event: &StreamEvent) {
        if self.json {
            Self::render_json(event);
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match event.kind {
            StreamEventKind::Text => Self::render_text(&mut state, event),
            StreamEventKind::Thinking => {
                Self::render_status(&mut state, "Thinking: ", &event.content);
            }
            StreamEventKind::ToolUse | StreamEventKind::ToolResult | StreamEventKind::Progress => {
                Self::render_status(&mut state, "", &event.content);
            }
            // reported through on_complete / on_error
            StreamEventKind::Complete | StreamEventKind::Error => {}
        }
    }

    fn on_complete(&self, message: &Message) {
        if self.json {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.printed_text && !message.content.is_empty() {
            let _ = write!(stdout(), "{}", message.content);
            state.needs_final_newline = !message.content.ends_with('\n');
        }
        if state.needs_final_newline {
            let _ = writeln!(stdout());
            state.needs_final_newline = false;
        }
        let _ = stdout().flush();
    }

    fn on_error(&self, _error: &str) {
        if self.json {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.needs_final_newline {
            let _ = writeln!(stdout());
            state.needs_final_newline = false;
        }
    }
}
