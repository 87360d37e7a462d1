//! Backend transports.
//!
//! A transport runs one request and streams its non-terminal events through an
//! [`EventSender`]. The terminal outcome is the return value: a
//! [`Completion`] or a [`TransportError`]. Terminal events produced by the
//! backend are absorbed into that outcome so callers observe exactly one.

pub mod decoder;
pub mod direct;
pub mod protocol;
pub mod selector;
pub mod subprocess;

use std::fmt;
use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::core::events::{StreamEvent, StreamEventKind, Usage};

/// Default channel capacity for event streams.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

pub type StreamEventTx = mpsc::Sender<StreamEvent>;
pub type StreamEventRx = mpsc::Receiver<StreamEvent>;

/// Creates a bounded event channel with the default capacity.
pub fn create_event_channel() -> (StreamEventTx, StreamEventRx) {
    mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY)
}

/// Reliable event sender: every send awaits channel capacity.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: StreamEventTx,
}

impl EventSender {
    pub fn new(tx: StreamEventTx) -> Self {
        Self { tx }
    }

    /// Awaits delivery. A closed receiver drops the event silently.
    pub async fn send(&self, event: StreamEvent) {
        let _ = self.tx.send(event).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Direct,
    Subprocess,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Direct => write!(f, "direct"),
            TransportKind::Subprocess => write!(f, "subprocess"),
        }
    }
}

/// One outgoing prompt.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub prompt: String,
    pub working_dir: PathBuf,
    /// Backend conversation to continue.
    pub session_id: Option<String>,
    /// Stamped onto every event of this request.
    pub request_id: String,
}

impl TransportRequest {
    pub fn new(prompt: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            working_dir: working_dir.into(),
            session_id: None,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Category of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The transport could not be used at all (probe failed, spawn failed).
    Unavailable,
    /// The backend broke mid-request (non-zero exit, broken stream).
    Runtime,
    /// The request exceeded its deadline and was terminated.
    Timeout,
    /// The backend reported a failure of its own.
    Backend,
    /// The backend exited cleanly without producing anything.
    NoData,
    /// The caller cancelled the request.
    Cancelled,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Unavailable => write!(f, "unavailable"),
            TransportErrorKind::Runtime => write!(f, "runtime"),
            TransportErrorKind::Timeout => write!(f, "timeout"),
            TransportErrorKind::Backend => write!(f, "backend"),
            TransportErrorKind::NoData => write!(f, "no_data"),
            TransportErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Structured transport error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// Process exit code, when a process was involved
    pub exit_code: Option<i32>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unavailable, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Runtime, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Backend, message)
    }

    pub fn no_data() -> Self {
        Self::new(TransportErrorKind::NoData, "No response from backend")
    }

    pub fn cancelled() -> Self {
        Self::new(TransportErrorKind::Cancelled, "Request cancelled")
    }

    #[must_use]
    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    /// Failures after which the selector may retry once over the subprocess.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Unavailable | TransportErrorKind::Runtime
        )
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TransportError {}

/// Successful outcome of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub transport: TransportKind,
    /// Final assistant content: the backend's result text when it sent one,
    /// otherwise the streamed text and tool-use blocks in order.
    pub content: String,
    pub session_id: Option<String>,
    pub usage: Option<Usage>,
}

/// Tracks one request's events, forwarding non-terminal ones and absorbing
/// the first terminal event into the outcome.
#[derive(Debug)]
pub(crate) struct RequestState {
    transport: TransportKind,
    request_id: String,
    streamed: String,
    final_result: Option<String>,
    session_id: Option<String>,
    usage: Option<Usage>,
    outcome: Option<Result<(), TransportError>>,
    forwarded: usize,
}

impl RequestState {
    pub(crate) fn new(transport: TransportKind, request: &TransportRequest) -> Self {
        Self {
            transport,
            request_id: request.request_id.clone(),
            streamed: String::new(),
            final_result: None,
            session_id: None,
            usage: None,
            outcome: None,
            forwarded: 0,
        }
    }

    /// Handles one event. Returns true once the request reached a terminal
    /// event; everything after it is discarded.
    pub(crate) async fn accept(&mut self, mut event: StreamEvent, sender: &EventSender) -> bool {
        if self.outcome.is_some() {
            return true;
        }

        if let Some(id) = event.session_id() {
            self.session_id = Some(id.to_string());
        }

        match event.kind {
            StreamEventKind::Complete => {
                if let Some(usage) = event.metadata.as_ref().and_then(|m| m.usage) {
                    self.usage = Some(usage);
                }
                self.outcome = Some(Ok(()));
                return true;
            }
            StreamEventKind::Error => {
                self.outcome = Some(Err(TransportError::backend(event.content)));
                return true;
            }
            StreamEventKind::Text if event.is_final_result() => {
                self.final_result = Some(event.content.clone());
            }
            StreamEventKind::Text | StreamEventKind::ToolUse => {
                self.streamed.push_str(&event.content);
            }
            _ => {}
        }

        event.metadata_mut().request_id = Some(self.request_id.clone());
        self.forwarded += 1;
        sender.send(event).await;
        false
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// True once any event was seen, terminal or not.
    pub(crate) fn saw_events(&self) -> bool {
        self.forwarded > 0 || self.outcome.is_some()
    }

    /// Backend-reported error, if the stream ended with one.
    pub(crate) fn backend_error(&self) -> Option<&TransportError> {
        match &self.outcome {
            Some(Err(e)) => Some(e),
            _ => None,
        }
    }

    /// Resolves the outcome of a stream that ended (normally or not).
    pub(crate) fn into_result(self) -> Result<Completion, TransportError> {
        match self.outcome {
            Some(Err(e)) => Err(e),
            Some(Ok(())) => Ok(self.completion()),
            None if self.forwarded == 0 => Err(TransportError::no_data()),
            None => Ok(self.completion()),
        }
    }

    fn completion(self) -> Completion {
        let content = self
            .final_result
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(self.streamed);
        Completion {
            transport: self.transport,
            content,
            session_id: self.session_id,
            usage: self.usage,
        }
    }
}
