//! File logging.
//!
//! Diagnostics go to `$AGENTLINK_HOME/logs/agentlink.log.<date>` so the
//! terminal stays owned by the command's own output.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, paths};

pub use tracing_appender::non_blocking::WorkerGuard;

/// Overrides `log_level` with a full filter directive.
pub const LOG_ENV: &str = "AGENTLINK_LOG";

const LOG_FILE_PREFIX: &str = "agentlink.log";

/// Installs the global subscriber. Keep the guard alive until exit so
/// buffered lines are flushed.
pub fn init(config: &Config) -> Result<WorkerGuard> {
    init_in(&paths::logs_dir(), &config.log_level)
}

/// Installs the global subscriber writing into `dir`.
///
/// A subscriber that is already installed is left in place.
pub fn init_in(dir: &Path, default_level: &str) -> Result<WorkerGuard> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        )
        .try_init()
        .ok();

    Ok(guard)
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        EnvFilter::try_new(default_level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}
