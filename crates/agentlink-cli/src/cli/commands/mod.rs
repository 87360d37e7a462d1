//! CLI command handlers.

pub mod config;
pub mod exec;
pub mod sessions;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Resolves `--root` to an absolute path; transcript directories are keyed
/// by it.
pub fn resolve_root(root: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(root).with_context(|| format!("resolve root {}", root.display()))
}
