//! Ctrl+C handling for interactive commands.
//!
//! The handler only flips a flag and wakes waiters; the caller decides what
//! an interrupt means (usually cancelling the in-flight request).

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Exit code conventionally used after SIGINT.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static INTERRUPT_NOTIFY: OnceLock<Notify> = OnceLock::new();

#[derive(Debug)]
pub struct InterruptedError;

impl std::fmt::Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interrupted")
    }
}

impl std::error::Error for InterruptedError {}

fn notify() -> &'static Notify {
    INTERRUPT_NOTIFY.get_or_init(Notify::new)
}

/// Installs the Ctrl+C handler.
///
/// The handler sets an interrupt flag only; it does not print anything, so
/// stdout/stderr stay owned by the command. A second Ctrl+C exits at once.
pub fn init() -> Result<()> {
    ctrlc::set_handler(trigger_ctrl_c).context("Failed to set Ctrl+C handler")
}

/// Triggers an interrupt, force-exiting on the second one.
pub fn trigger_ctrl_c() {
    if INTERRUPTED.swap(true, Ordering::SeqCst) {
        std::process::exit(INTERRUPTED_EXIT_CODE);
    }
    notify().notify_waiters();
}

/// Checks if an interrupt has been requested.
pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Waits until an interrupt is triggered.
pub async fn wait_for_interrupt() {
    loop {
        let notified = notify().notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if is_interrupted() {
            return;
        }
        notified.await;
    }
}

/// Cancels `token` when Ctrl+C is pressed. The watcher ends with the token.
pub fn cancel_on_interrupt(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = wait_for_interrupt() => token.cancel(),
            () = token.cancelled() => {}
        }
    })
}

/// Resets the interrupt flag.
pub fn reset() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn interrupt_cancels_watched_token() {
        reset();
        let token = CancellationToken::new();
        let watcher = cancel_on_interrupt(token.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!token.is_cancelled());
        trigger_ctrl_c();

        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
        watcher.await.unwrap();
        assert!(is_interrupted());
        reset();
        assert!(!is_interrupted());
    }
}
