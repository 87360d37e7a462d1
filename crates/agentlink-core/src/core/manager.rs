//! Session orchestration.
//!
//! The manager owns the active session, runs one request at a time through
//! the transport selector, relays events to the caller's sink and records the
//! outcome on the session.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::events::{StreamEvent, StreamEventKind};
use crate::core::session::{
    Message, MessageMetadata, Session, SessionStatus, ToolCall, dedup_sessions,
};
use crate::core::session_store::{SessionStore, project_key};
use crate::core::sink::EventSink;
use crate::transport::direct::{DirectBackend, DirectTransport};
use crate::transport::selector::{SelectorError, TransportMode, TransportSelector};
use crate::transport::subprocess::SubprocessTransport;
use crate::transport::{
    Completion, EventSender, TransportErrorKind, TransportRequest, create_event_channel,
};

/// Errors returned by manager calls made outside a request.
#[derive(Debug)]
pub enum ManagerError {
    /// The transport probe has not run yet.
    NotInitialized,
    /// A request is already in flight.
    Busy,
    SessionNotFound(String),
    Store(anyhow::Error),
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerError::NotInitialized => write!(f, "Session manager is not initialized"),
            ManagerError::Busy => write!(f, "A request is already in progress"),
            ManagerError::SessionNotFound(id) => write!(f, "Session '{id}' not found"),
            ManagerError::Store(e) => write!(f, "Failed to read sessions: {e:#}"),
        }
    }
}

impl std::error::Error for ManagerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ManagerError::Store(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Completed(Message),
    /// The caller cancelled; the message holds the partial reply.
    Cancelled(Message),
    Failed(String),
}

/// Handle to an in-flight request.
#[derive(Debug)]
pub struct RequestHandle {
    request_id: String,
    cancel: CancellationToken,
    task: JoinHandle<RequestOutcome>,
}

impl RequestHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Stops the request. No events are relayed afterwards.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the request to finish.
    pub async fn wait(self) -> RequestOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => RequestOutcome::Failed(format!("Request task failed: {e}")),
        }
    }
}

struct Inner {
    selector: TransportSelector,
    store: SessionStore,
    working_dir: PathBuf,
    active: Mutex<Option<Session>>,
    busy: AtomicBool,
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, Option<Session>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the busy flag when the request task ends, however it ends.
struct BusyGuard(Arc<Inner>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::SeqCst);
    }
}

/// Cheap to clone; clones share the active session and transports.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("working_dir", &self.inner.working_dir)
            .field("mode", &self.inner.selector.mode())
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(selector: TransportSelector, store: SessionStore, working_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(Inner {
                selector,
                store,
                working_dir,
                active: Mutex::new(None),
                busy: AtomicBool::new(false),
            }),
        }
    }

    /// Builds a manager from configuration. Without a direct backend the
    /// probe settles on the subprocess transport.
    pub fn from_config(
        config: &Config,
        working_dir: PathBuf,
        direct: Option<Arc<dyn DirectBackend>>,
    ) -> Self {
        let direct = direct.map_or_else(DirectTransport::unbound, DirectTransport::new);
        let direct = direct
            .with_model(config.backend.model.clone())
            .with_timeout(config.request_timeout())
            .with_probe_timeout(config.probe_timeout());
        let selector = TransportSelector::new(
            direct,
            SubprocessTransport::new(config.subprocess_options()),
        );
        Self::new(selector, config.session_store(), working_dir)
    }

    /// Probes the transports. Later calls return the settled mode.
    pub async fn initialize(&self) -> TransportMode {
        self.inner.selector.probe().await
    }

    /// Re-probes the direct transport.
    pub async fn refresh_transport(&self) -> TransportMode {
        self.inner.selector.refresh().await
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.inner.selector.mode()
    }

    pub fn working_dir(&self) -> &Path {
        &self.inner.working_dir
    }

    /// Transcript directory name of the working directory.
    pub fn project_key(&self) -> String {
        project_key(&self.inner.working_dir)
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    pub fn active_session(&self) -> Option<Session> {
        self.inner.active().clone()
    }

    /// Starts a request and returns immediately.
    ///
    /// The user message is appended before the transport starts. Events reach
    /// `sink` in order, followed by exactly one `on_complete` or `on_error`.
    ///
    /// # Errors
    /// `NotInitialized` before `initialize`, `Busy` while another request is
    /// in flight.
    pub fn send_streaming(
        &self,
        prompt: impl Into<String>,
        sink: Arc<dyn EventSink>,
    ) -> Result<RequestHandle, ManagerError> {
        if matches!(
            self.transport_mode(),
            TransportMode::Unprobed | TransportMode::ProbingDirect
        ) {
            return Err(ManagerError::NotInitialized);
        }
        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ManagerError::Busy);
        }
        let guard = BusyGuard(Arc::clone(&self.inner));

        let prompt = prompt.into();
        let mut request = TransportRequest::new(prompt.clone(), self.inner.working_dir.clone());
        let session_id = {
            let mut active = self.inner.active();
            let session = active.get_or_insert_with(Session::new);
            let mut message = Message::user(prompt);
            message.metadata.request_id = Some(request.request_id.clone());
            session.append(message);
            request.session_id.clone_from(&session.metadata.backend_session_id);
            session.id.clone()
        };
        info!(request_id = %request.request_id, %session_id, "Sending request");

        let cancel = CancellationToken::new();
        let request_id = request.request_id.clone();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            run_request(&inner, &request, &session_id, sink.as_ref(), &token, guard).await
        });

        Ok(RequestHandle {
            request_id,
            cancel,
            task,
        })
    }

    /// Loads a stored session and makes it the active one, republishing its
    /// messages through `sink.on_message` in order.
    ///
    /// # Errors
    /// `SessionNotFound` for unknown ids, `Store` when the transcripts cannot
    /// be read.
    pub fn resume_session(&self, id: &str, sink: &dyn EventSink) -> Result<Session, ManagerError> {
        let mut session = self
            .inner
            .store
            .get_session(id)
            .map_err(ManagerError::Store)?
            .ok_or_else(|| ManagerError::SessionNotFound(id.to_string()))?;
        if session.metadata.backend_session_id.is_none() {
            session.metadata.backend_session_id = Some(session.id.clone());
        }

        for message in &session.messages {
            sink.on_message(message);
        }
        info!(session_id = %session.id, messages = session.messages.len(), "Resumed session");
        *self.inner.active() = Some(session.clone());
        Ok(session)
    }

    /// Drops the active session; the next prompt starts a fresh one.
    pub fn new_session(&self) {
        *self.inner.active() = None;
    }

    /// Sessions of the current project, merged with the active session.
    ///
    /// # Errors
    /// `Store` when the transcripts cannot be read.
    pub fn list_sessions(&self) -> Result<Vec<Session>, ManagerError> {
        let persisted = self
            .inner
            .store
            .list_sessions(&self.project_key())
            .map_err(ManagerError::Store)?;
        let active: Vec<Session> = self
            .active_session()
            .filter(|s| !s.messages.is_empty())
            .into_iter()
            .collect();
        Ok(dedup_sessions([active, persisted]))
    }
}

/// Collects what was streamed so a cancelled request can keep it.
#[derive(Debug, Default)]
struct PartialReply {
    content: String,
    tool_calls: Vec<ToolCall>,
    files: Vec<String>,
}

impl PartialReply {
    fn observe(&mut self, event: &StreamEvent) {
        match event.kind {
            StreamEventKind::Text if !event.is_final_result() => {
                self.content.push_str(&event.content);
            }
            StreamEventKind::ToolUse => {
                self.content.push_str(&event.content);
                if let Some(meta) = &event.metadata {
                    if let Some(name) = &meta.tool_name {
                        self.tool_calls.push(ToolCall {
                            id: meta.tool_use_id.clone(),
                            name: name.clone(),
                            input: meta.tool_input.clone().unwrap_or_default(),
                        });
                    }
                    if let Some(path) = &meta.file_path
                        && !self.files.contains(path)
                    {
                        self.files.push(path.clone());
                    }
                }
            }
            _ => {}
        }
    }
}

async fn run_request(
    inner: &Inner,
    request: &TransportRequest,
    session_id: &str,
    sink: &dyn EventSink,
    cancel: &CancellationToken,
    busy: BusyGuard,
) -> RequestOutcome {
    let (tx, mut rx) = create_event_channel();
    let sender = EventSender::new(tx);

    let transport = async {
        let sender = sender;
        inner.selector.send(request, &sender, cancel).await
    };
    let relay = async {
        let mut partial = PartialReply::default();
        while let Some(event) = rx.recv().await {
            if cancel.is_cancelled() {
                continue;
            }
            partial.observe(&event);
            sink.on_event(&event);
            if let Some(progress) = event.progress_value() {
                sink.on_progress(progress);
            }
        }
        partial
    };
    let (result, partial) = tokio::join!(transport, relay);

    let outcome = match result {
        Ok(completion) => complete(inner, request, session_id, sink, completion, partial),
        Err(_) if cancel.is_cancelled() => cancelled(inner, request, session_id, partial),
        Err(SelectorError::Transport(e)) if e.kind == TransportErrorKind::Cancelled => {
            cancelled(inner, request, session_id, partial)
        }
        Err(e) => failed(inner, request, session_id, sink, &e.to_string()),
    };

    // The terminal callback may start the next request.
    drop(busy);
    match &outcome {
        RequestOutcome::Completed(message) | RequestOutcome::Cancelled(message) => {
            sink.on_complete(message);
        }
        RequestOutcome::Failed(error) => sink.on_error(error),
    }
    outcome
}

fn complete(
    inner: &Inner,
    request: &TransportRequest,
    session_id: &str,
    sink: &dyn EventSink,
    completion: Completion,
    partial: PartialReply,
) -> RequestOutcome {
    info!(transport = %completion.transport, "Request completed");

    let mut message = Message::assistant(completion.content);
    message.files = partial.files;
    message.metadata = MessageMetadata {
        tool_calls: partial.tool_calls,
        session_id: completion.session_id.clone(),
        request_id: Some(request.request_id.clone()),
        usage: completion.usage,
        ..MessageMetadata::default()
    };
    record(inner, session_id, &message, SessionStatus::Completed, completion.session_id);

    let mut event = StreamEvent::complete();
    let meta = event.metadata_mut();
    meta.request_id = Some(request.request_id.clone());
    meta.session_id.clone_from(&message.metadata.session_id);
    meta.usage = message.metadata.usage;
    sink.on_event(&event);
    RequestOutcome::Completed(message)
}

fn cancelled(
    inner: &Inner,
    request: &TransportRequest,
    session_id: &str,
    partial: PartialReply,
) -> RequestOutcome {
    info!("Request cancelled");

    let mut message = Message::assistant(partial.content);
    message.files = partial.files;
    message.metadata = MessageMetadata {
        tool_calls: partial.tool_calls,
        request_id: Some(request.request_id.clone()),
        cancelled: true,
        ..MessageMetadata::default()
    };
    record(inner, session_id, &message, SessionStatus::Completed, None);
    RequestOutcome::Cancelled(message)
}

fn failed(
    inner: &Inner,
    request: &TransportRequest,
    session_id: &str,
    sink: &dyn EventSink,
    description: &str,
) -> RequestOutcome {
    warn!("Request failed: {description}");

    let mut message = Message::assistant(description);
    message.metadata.request_id = Some(request.request_id.clone());
    message.metadata.is_error = true;
    record(inner, session_id, &message, SessionStatus::Error, None);

    let mut event = StreamEvent::error(description);
    event.metadata_mut().request_id = Some(request.request_id.clone());
    sink.on_event(&event);
    RequestOutcome::Failed(description.to_string())
}

/// Appends the reply to the session the request was made on, if it is still
/// the active one.
fn record(
    inner: &Inner,
    session_id: &str,
    message: &Message,
    status: SessionStatus,
    backend_session_id: Option<String>,
) {
    let mut active = inner.active();
    let Some(session) = active.as_mut().filter(|s| s.id == session_id) else {
        debug!(session_id, "Active session changed during request; reply not recorded");
        return;
    };

    session.append(message.clone());
    session.status = status;
    if session.metadata.backend_session_id.is_none()
        && let Some(backend_id) = backend_session_id
    {
        session.id.clone_from(&backend_id);
        session.metadata.backend_session_id = Some(backend_id);
    }
}
