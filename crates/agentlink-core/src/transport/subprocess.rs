//! Subprocess transport: runs the backend CLI and decodes its stream-json
//! output.
//!
//! The prompt goes to stdin; stdout is decoded incrementally; stderr is kept
//! as a bounded tail for error messages.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::classify::ThinkingClassifier;
use crate::transport::decoder::StreamDecoder;
use crate::transport::protocol::truncate_chars;
use crate::transport::{
    Completion, EventSender, RequestState, TransportError, TransportKind, TransportRequest,
};

pub const DEFAULT_EXECUTABLE: &str = "claude";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(3);

const READ_CHUNK_BYTES: usize = 8 * 1024;
const STDERR_TAIL_CHARS: usize = 2000;
const STDERR_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How the backend CLI is launched.
#[derive(Debug, Clone)]
pub struct SubprocessOptions {
    pub executable: PathBuf,
    pub model: Option<String>,
    /// Appended after the built-in arguments.
    pub extra_args: Vec<String>,
    pub timeout: Duration,
    /// Time between the graceful signal and the forced kill.
    pub terminate_grace: Duration,
    pub classifier: ThinkingClassifier,
}

impl Default for SubprocessOptions {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(DEFAULT_EXECUTABLE),
            model: None,
            extra_args: Vec::new(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            classifier: ThinkingClassifier::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubprocessTransport {
    options: SubprocessOptions,
}

/// Why the stdout loop stopped.
enum StreamEnd {
    Eof,
    /// A terminal event arrived; later output is irrelevant.
    Finished,
    Cancelled,
    TimedOut,
    ReadFailed(std::io::Error),
}

impl SubprocessTransport {
    pub fn new(options: SubprocessOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SubprocessOptions {
        &self.options
    }

    /// Command-line arguments for one request (the prompt goes to stdin).
    pub fn build_args(&self, request: &TransportRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-p", "--verbose", "--output-format", "stream-json"]
            .into_iter()
            .map(OsString::from)
            .collect();

        if let Some(session_id) = normalize_optional(request.session_id.as_deref()) {
            args.push(OsString::from("--resume"));
            args.push(OsString::from(session_id));
        }

        if let Some(model) = normalize_optional(self.options.model.as_deref()) {
            args.push(OsString::from("--model"));
            args.push(OsString::from(model));
        }

        args.extend(self.options.extra_args.iter().map(OsString::from));
        args
    }

    /// Runs one request to completion, streaming events through `sender`.
    ///
    /// # Errors
    /// `Unavailable` when the process cannot be spawned, `Runtime` on a
    /// non-zero exit or broken output, `Backend` when the backend reported a
    /// failure, `NoData` on a clean exit without output, `Timeout` and
    /// `Cancelled` when the process had to be terminated.
    pub async fn send(
        &self,
        request: &TransportRequest,
        sender: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<Completion, TransportError> {
        let exe = &self.options.executable;
        let mut child = Command::new(exe)
            .args(self.build_args(request))
            .current_dir(&request.working_dir)
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TransportError::unavailable(format!(
                    "Failed to start backend '{}': {e}",
                    exe.display()
                ))
            })?;
        info!(
            pid = child.id(),
            exe = %exe.display(),
            resume = request.session_id.is_some(),
            "Spawned backend process"
        );

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    debug!("Failed to write prompt to backend stdin: {e}");
                }
                // Dropping stdin closes it so the backend sees EOF.
            });
        }
        let stderr_task = child.stderr.take().map(spawn_stderr_tail);
        let Some(mut stdout) = child.stdout.take() else {
            return Err(TransportError::runtime("Backend stdout was not captured"));
        };

        let deadline = tokio::time::sleep(self.options.timeout);
        tokio::pin!(deadline);

        let mut decoder = StreamDecoder::new(self.options.classifier.clone());
        let mut state = RequestState::new(TransportKind::Subprocess, request);

        let end = read_stream(
            &mut stdout,
            &mut decoder,
            &mut state,
            sender,
            cancel,
            &mut deadline,
        )
        .await;

        let status = match end {
            StreamEnd::Eof => {
                for event in decoder.finish() {
                    state.accept(event, sender).await;
                }
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        self.terminate(&mut child).await;
                        return Err(TransportError::cancelled());
                    }
                    () = &mut deadline => {
                        self.terminate(&mut child).await;
                        return Err(self.timeout_error());
                    }
                    status = child.wait() => status.map_err(|e| {
                        TransportError::runtime(format!("Failed to wait for backend: {e}"))
                    })?,
                }
            }
            StreamEnd::Finished => {
                self.settle(&mut child).await;
                return state.into_result();
            }
            StreamEnd::Cancelled => {
                self.terminate(&mut child).await;
                return Err(TransportError::cancelled());
            }
            StreamEnd::TimedOut => {
                self.terminate(&mut child).await;
                return Err(self.timeout_error());
            }
            StreamEnd::ReadFailed(e) => {
                self.terminate(&mut child).await;
                return Err(TransportError::runtime(format!(
                    "Failed to read backend output: {e}"
                )));
            }
        };

        let stderr_tail = join_stderr(stderr_task).await;
        finish(status, state, &stderr_tail)
    }

    fn timeout_error(&self) -> TransportError {
        warn!(
            "Backend request timed out after {}s",
            self.options.timeout.as_secs()
        );
        TransportError::timeout(format!(
            "Request timed out after {} seconds",
            self.options.timeout.as_secs()
        ))
    }

    /// Lets a backend that already delivered its result exit on its own,
    /// terminating it after the grace period.
    async fn settle(&self, child: &mut Child) {
        match tokio::time::timeout(self.options.terminate_grace, child.wait()).await {
            Ok(Ok(status)) => info!(code = status.code(), "Backend process exited"),
            Ok(Err(e)) => debug!("Failed to wait for backend: {e}"),
            Err(_elapsed) => {
                debug!("Backend still running after its result, terminating");
                self.terminate(child).await;
            }
        }
    }

    /// Sends a graceful termination signal, then kills after the grace period.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) {
            // SAFETY: `pid` is our own child, which has not been reaped yet
            // because `child.id()` returned it.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
            if tokio::time::timeout(self.options.terminate_grace, child.wait())
                .await
                .is_ok()
            {
                debug!(pid, "Backend exited after SIGTERM");
                return;
            }
            warn!(pid, "Backend ignored SIGTERM, killing");
        }

        if let Err(e) = child.kill().await {
            debug!("Failed to kill backend process: {e}");
        }
    }
}

async fn read_stream<R, D>(
    stdout: &mut R,
    decoder: &mut StreamDecoder,
    state: &mut RequestState,
    sender: &EventSender,
    cancel: &CancellationToken,
    deadline: &mut std::pin::Pin<&mut D>,
) -> StreamEnd
where
    R: AsyncRead + Unpin,
    D: std::future::Future<Output = ()>,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return StreamEnd::Cancelled,
            () = deadline.as_mut() => return StreamEnd::TimedOut,
            read = stdout.read(&mut buf) => match read {
                Ok(0) => return StreamEnd::Eof,
                Ok(n) => {
                    for event in decoder.push(&buf[..n]) {
                        if state.is_finished() {
                            debug!("Discarding backend output after terminal event");
                            break;
                        }
                        state.accept(event, sender).await;
                    }
                    if state.is_finished() {
                        return StreamEnd::Finished;
                    }
                }
                Err(e) => return StreamEnd::ReadFailed(e),
            }
        }
    }
}

/// Maps the exit status and stream state to the request outcome.
fn finish(
    status: ExitStatus,
    state: RequestState,
    stderr_tail: &str,
) -> Result<Completion, TransportError> {
    let code = status.code();
    info!(code, "Backend process exited");

    if status.success() {
        return state.into_result();
    }

    if let Some(err) = state.backend_error() {
        return Err(err.clone().with_exit_code(code));
    }

    let described = code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}"));
    let message = if stderr_tail.is_empty() {
        format!("Backend exited with {described}")
    } else {
        format!("Backend exited with {described}: {stderr_tail}")
    };
    Err(TransportError::runtime(message).with_exit_code(code))
}

fn spawn_stderr_tail<R>(mut stderr: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut raw = Vec::new();
        if let Err(e) = stderr.read_to_end(&mut raw).await {
            debug!("Failed to read backend stderr: {e}");
        }
        let text = String::from_utf8_lossy(&raw);
        let text = text.trim();
        let skip = text.chars().count().saturating_sub(STDERR_TAIL_CHARS);
        let tail: String = text.chars().skip(skip).collect();
        truncate_chars(&tail, STDERR_TAIL_CHARS)
    })
}

async fn join_stderr(task: Option<JoinHandle<String>>) -> String {
    let Some(task) = task else {
        return String::new();
    };
    match tokio::time::timeout(STDERR_JOIN_TIMEOUT, task).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(e)) => {
            debug!("Stderr reader failed: {e}");
            String::new()
        }
        Err(_elapsed) => String::new(),
    }
}

fn normalize_optional(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}
