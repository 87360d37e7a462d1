//! Transport selection with a memoized probe and a one-shot fallback.
//!
//! ```text
//! Unprobed ──probe──▶ ProbingDirect ──ok──▶ DirectActive
//!                           │                   │ fallback-eligible failure
//!                           └──fail──▶ CliOnly ◀┘
//! ```
//!
//! The mode is read on every `send`, so a demotion made by one request is
//! seen by the next. Re-probing only happens through `refresh`.

use std::fmt;
use std::sync::{PoisonError, RwLock};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::transport::direct::DirectTransport;
use crate::transport::subprocess::SubprocessTransport;
use crate::transport::{Completion, EventSender, TransportError, TransportRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Unprobed,
    ProbingDirect,
    DirectActive,
    CliOnly,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Unprobed => write!(f, "unprobed"),
            TransportMode::ProbingDirect => write!(f, "probing"),
            TransportMode::DirectActive => write!(f, "direct"),
            TransportMode::CliOnly => write!(f, "cli-only"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    /// `send` was called before the probe finished.
    NotInitialized,
    Transport(TransportError),
}

impl fmt::Display for SelectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorError::NotInitialized => write!(f, "Transport selector is not initialized"),
            SelectorError::Transport(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SelectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SelectorError::NotInitialized => None,
            SelectorError::Transport(e) => Some(e),
        }
    }
}

impl From<TransportError> for SelectorError {
    fn from(e: TransportError) -> Self {
        SelectorError::Transport(e)
    }
}

#[derive(Debug)]
pub struct TransportSelector {
    direct: DirectTransport,
    subprocess: SubprocessTransport,
    mode: RwLock<TransportMode>,
    probe_lock: Mutex<()>,
}

impl TransportSelector {
    pub fn new(direct: DirectTransport, subprocess: SubprocessTransport) -> Self {
        Self {
            direct,
            subprocess,
            mode: RwLock::new(TransportMode::Unprobed),
            probe_lock: Mutex::new(()),
        }
    }

    pub fn mode(&self) -> TransportMode {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_mode(&self, mode: TransportMode) {
        *self.mode.write().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    /// Probes the direct transport once; later calls return the settled mode.
    pub async fn probe(&self) -> TransportMode {
        let _guard = self.probe_lock.lock().await;
        match self.mode() {
            TransportMode::Unprobed | TransportMode::ProbingDirect => self.run_probe().await,
            settled => settled,
        }
    }

    /// Re-probes the direct transport regardless of the current mode.
    pub async fn refresh(&self) -> TransportMode {
        let _guard = self.probe_lock.lock().await;
        self.run_probe().await
    }

    /// A re-probe keeps the settled mode visible until its result is known.
    async fn run_probe(&self) -> TransportMode {
        if self.mode() == TransportMode::Unprobed {
            self.set_mode(TransportMode::ProbingDirect);
        }
        let mode = match self.direct.probe().await {
            Ok(()) => TransportMode::DirectActive,
            Err(e) => {
                info!("Direct transport unavailable, using subprocess: {e}");
                TransportMode::CliOnly
            }
        };
        self.set_mode(mode);
        info!(%mode, "Transport selected");
        mode
    }

    /// Sends through the active transport.
    ///
    /// In `DirectActive`, a fallback-eligible direct failure demotes the
    /// selector to `CliOnly` and retries the request once via the subprocess.
    ///
    /// # Errors
    /// `NotInitialized` before the probe settled; otherwise the error of the
    /// last transport tried.
    pub async fn send(
        &self,
        request: &TransportRequest,
        sender: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<Completion, SelectorError> {
        match self.mode() {
            TransportMode::Unprobed | TransportMode::ProbingDirect => {
                Err(SelectorError::NotInitialized)
            }
            TransportMode::CliOnly => Ok(self.subprocess.send(request, sender, cancel).await?),
            TransportMode::DirectActive => {
                match self.direct.send(request, sender, cancel).await {
                    Ok(completion) => Ok(completion),
                    Err(e) if e.is_fallback_eligible() && !cancel.is_cancelled() => {
                        warn!("Direct transport failed, falling back to subprocess: {e}");
                        self.set_mode(TransportMode::CliOnly);
                        Ok(self.subprocess.send(request, sender, cancel).await?)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}
