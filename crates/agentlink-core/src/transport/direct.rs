//! Direct transport: iterates an in-process backend message stream.
//!
//! The backend is bound through the [`DirectBackend`] capability trait. When
//! nothing is bound, or the bound backend fails its probe, the transport is
//! unavailable and the selector falls back to the subprocess.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::transport::protocol::BackendMessage;
use crate::transport::subprocess::DEFAULT_REQUEST_TIMEOUT;
use crate::transport::{
    Completion, EventSender, RequestState, TransportError, TransportKind, TransportRequest,
};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Stream of backend-native messages for one query.
pub type BackendStream = BoxStream<'static, anyhow::Result<BackendMessage>>;

/// Per-query options handed to the backend.
#[derive(Debug, Clone, Default)]
pub struct DirectOptions {
    pub working_dir: PathBuf,
    pub session_id: Option<String>,
    pub model: Option<String>,
}

/// An in-process backend that yields typed messages.
pub trait DirectBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Checks that the backend can serve queries.
    fn probe(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Starts a query. Dropping the returned stream releases its resources.
    fn query(
        &self,
        prompt: String,
        options: DirectOptions,
    ) -> BoxFuture<'_, anyhow::Result<BackendStream>>;
}

#[derive(Clone)]
pub struct DirectTransport {
    backend: Option<Arc<dyn DirectBackend>>,
    model: Option<String>,
    timeout: Duration,
    probe_timeout: Duration,
}

impl std::fmt::Debug for DirectTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectTransport")
            .field("backend", &self.backend.as_ref().map(|b| b.name().to_string()))
            .field("timeout", &self.timeout)
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for DirectTransport {
    fn default() -> Self {
        Self::unbound()
    }
}

impl DirectTransport {
    pub fn new(backend: Arc<dyn DirectBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::unbound()
        }
    }

    /// A transport with no backend; its probe always fails.
    pub fn unbound() -> Self {
        Self {
            backend: None,
            model: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn is_bound(&self) -> bool {
        self.backend.is_some()
    }

    fn backend(&self) -> Result<&Arc<dyn DirectBackend>, TransportError> {
        self.backend
            .as_ref()
            .ok_or_else(|| TransportError::unavailable("No direct backend is bound"))
    }

    /// One-shot, time-bounded availability check.
    ///
    /// # Errors
    /// Always `Unavailable`: no backend bound, probe error, or probe timeout.
    pub async fn probe(&self) -> Result<(), TransportError> {
        let backend = self.backend()?;
        match tokio::time::timeout(self.probe_timeout, backend.probe()).await {
            Ok(Ok(())) => {
                info!(backend = backend.name(), "Direct backend available");
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::unavailable(format!(
                "Direct backend '{}' failed its probe: {e:#}",
                backend.name()
            ))),
            Err(_elapsed) => Err(TransportError::unavailable(format!(
                "Direct backend '{}' probe timed out after {}ms",
                backend.name(),
                self.probe_timeout.as_millis()
            ))),
        }
    }

    /// Runs one request, mapping backend messages to events in order.
    ///
    /// # Errors
    /// `Unavailable` without a backend, `Runtime` when the query cannot start
    /// or the stream breaks, `Backend` for reported failures, `NoData` for an
    /// empty stream, `Timeout` and `Cancelled` when iteration was stopped.
    pub async fn send(
        &self,
        request: &TransportRequest,
        sender: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<Completion, TransportError> {
        let backend = self.backend()?;
        if cancel.is_cancelled() {
            return Err(TransportError::cancelled());
        }
        let options = DirectOptions {
            working_dir: request.working_dir.clone(),
            session_id: request.session_id.clone(),
            model: self.model.clone(),
        };

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransportError::cancelled()),
            () = &mut deadline => return Err(self.timeout_error()),
            started = backend.query(request.prompt.clone(), options) => started.map_err(|e| {
                TransportError::runtime(format!("Direct query failed to start: {e:#}"))
            })?,
        };
        debug!(backend = backend.name(), "Direct query started");

        let mut state = RequestState::new(TransportKind::Direct, request);
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransportError::cancelled()),
                () = &mut deadline => return Err(self.timeout_error()),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    for event in message.into_events() {
                        if state.accept(event, sender).await {
                            break;
                        }
                    }
                    if state.is_finished() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    return Err(TransportError::runtime(format!(
                        "Direct stream failed: {e:#}"
                    )));
                }
                None => break,
            }
        }

        state.into_result()
    }

    fn timeout_error(&self) -> TransportError {
        TransportError::timeout(format!(
            "Request timed out after {} seconds",
            self.timeout.as_secs()
        ))
    }
}

/// Scripted backends for tests across the crate.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::FutureExt;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum ProbeBehavior {
        Ok,
        Fail,
        Hang,
    }

    /// Replays one script per query; an `Err` item breaks the stream. With
    /// `hang_after_script`, the stream stays open once the script is played.
    pub(crate) struct ScriptedBackend {
        pub(crate) probe: ProbeBehavior,
        pub(crate) hang_after_script: bool,
        scripts: Mutex<Vec<Vec<Result<BackendMessage, String>>>>,
        pub(crate) queries: AtomicUsize,
        pub(crate) probes: AtomicUsize,
    }

    impl ScriptedBackend {
        pub(crate) fn new(
            probe: ProbeBehavior,
            scripts: Vec<Vec<Result<BackendMessage, String>>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                probe,
                hang_after_script: false,
                scripts: Mutex::new(scripts),
                queries: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
            })
        }

        pub(crate) fn hanging(scripts: Vec<Vec<Result<BackendMessage, String>>>) -> Arc<Self> {
            Arc::new(Self {
                probe: ProbeBehavior::Ok,
                hang_after_script: true,
                scripts: Mutex::new(scripts),
                queries: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
            })
        }
    }

    impl DirectBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn probe(&self) -> BoxFuture<'_, anyhow::Result<()>> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            match self.probe {
                ProbeBehavior::Ok => async { anyhow::Ok(()) }.boxed(),
                ProbeBehavior::Fail => {
                    async { Err::<(), _>(anyhow::anyhow!("library missing")) }.boxed()
                }
                ProbeBehavior::Hang => futures_util::future::pending::<anyhow::Result<()>>().boxed(),
            }
        }

        fn query(
            &self,
            _prompt: String,
            _options: DirectOptions,
        ) -> BoxFuture<'_, anyhow::Result<BackendStream>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let script = {
                let mut scripts = self.scripts.lock().unwrap();
                if scripts.is_empty() {
                    Vec::new()
                } else {
                    scripts.remove(0)
                }
            };
            let items = script
                .into_iter()
                .map(|item| item.map_err(|e| anyhow::anyhow!(e)));
            let stream = futures_util::stream::iter(items);
            let stream = if self.hang_after_script {
                stream.chain(futures_util::stream::pending()).boxed()
            } else {
                stream.boxed()
            };
            async move { Ok(stream) }.boxed()
        }
    }

    pub(crate) fn success_script(text: &str) -> Vec<Result<BackendMessage, String>> {
        vec![
            Ok(BackendMessage::System {
                subtype: Some("init".to_string()),
                session_id: Some("direct-session".to_string()),
                model: None,
                cwd: None,
            }),
            Ok(BackendMessage::Result {
                subtype: Some("success".to_string()),
                result: Some(text.to_string()),
                is_error: false,
                session_id: Some("direct-session".to_string()),
                usage: None,
                duration_ms: None,
                total_cost_usd: None,
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::{ProbeBehavior, ScriptedBackend, success_script};
    use super::*;
    use crate::core::events::{StreamEvent, StreamEventKind};
    use crate::transport::{TransportErrorKind, create_event_channel};

    async fn run(
        transport: &DirectTransport,
        cancel: &CancellationToken,
    ) -> (Result<Completion, TransportError>, Vec<StreamEvent>) {
        let (tx, mut rx) = create_event_channel();
        let sender = EventSender::new(tx);
        let request = TransportRequest::new("hi", ".");
        let result = transport.send(&request, &sender, cancel).await;
        drop(sender);
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        (result, events)
    }

    #[tokio::test]
    async fn unbound_probe_is_unavailable() {
        let err = DirectTransport::unbound().probe().await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn probe_timeout_is_unavailable() {
        let backend = ScriptedBackend::new(ProbeBehavior::Hang, vec![]);
        let transport =
            DirectTransport::new(backend).with_probe_timeout(Duration::from_millis(50));
        let err = transport.probe().await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Unavailable);
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test]
    async fn native_messages_map_to_events() {
        let mut script = vec![
            Ok(BackendMessage::Thinking {
                content: "planning".to_string(),
            }),
            Ok(BackendMessage::Progress {
                progress: Some(0.5),
                message: Some("halfway".to_string()),
            }),
        ];
        script.extend(success_script("All good"));
        let backend = ScriptedBackend::new(ProbeBehavior::Ok, vec![script]);
        let transport = DirectTransport::new(backend);

        let (result, events) = run(&transport, &CancellationToken::new()).await;
        let completion = result.unwrap();
        assert_eq!(completion.content, "All good");
        assert_eq!(completion.transport, TransportKind::Direct);
        assert_eq!(completion.session_id.as_deref(), Some("direct-session"));

        let kinds: Vec<StreamEventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StreamEventKind::Thinking,
                StreamEventKind::Progress,
                StreamEventKind::Progress,
                StreamEventKind::Text,
            ]
        );
    }

    #[tokio::test]
    async fn broken_stream_is_runtime_error() {
        let script = vec![
            Ok(BackendMessage::Thinking {
                content: "x".to_string(),
            }),
            Err("connection reset".to_string()),
        ];
        let backend = ScriptedBackend::new(ProbeBehavior::Ok, vec![script]);
        let (result, _) = run(&DirectTransport::new(backend), &CancellationToken::new()).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Runtime);
        assert!(err.message.contains("connection reset"));
    }

    #[tokio::test]
    async fn empty_stream_is_no_data() {
        let backend = ScriptedBackend::new(ProbeBehavior::Ok, vec![vec![]]);
        let (result, _) = run(&DirectTransport::new(backend), &CancellationToken::new()).await;
        assert_eq!(result.unwrap_err().kind, TransportErrorKind::NoData);
    }

    #[tokio::test]
    async fn cancelled_before_start_does_not_query() {
        let backend = ScriptedBackend::new(ProbeBehavior::Ok, vec![success_script("x")]);
        let transport = DirectTransport::new(backend.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (result, events) = run(&transport, &cancel).await;
        assert_eq!(result.unwrap_err().kind, TransportErrorKind::Cancelled);
        assert!(events.is_empty());
        assert_eq!(backend.queries.load(Ordering::SeqCst), 0);
    }
}
