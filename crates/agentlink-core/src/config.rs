//! Configuration management for agentlink.
//!
//! Loads configuration from ${AGENTLINK_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::classify::ThinkingClassifier;
use crate::core::session_store::SessionStore;
use crate::transport::direct::DEFAULT_PROBE_TIMEOUT;
use crate::transport::subprocess::{
    DEFAULT_EXECUTABLE, DEFAULT_REQUEST_TIMEOUT, DEFAULT_TERMINATE_GRACE, SubprocessOptions,
};

/// Overrides `backend.executable`.
pub const BACKEND_ENV: &str = "AGENTLINK_BACKEND";

fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

pub mod paths {
    //! Path resolution for agentlink configuration and data directories.
    //!
    //! AGENTLINK_HOME resolution order:
    //! 1. AGENTLINK_HOME environment variable (if set)
    //! 2. ~/.config/agentlink (default)

    use std::path::PathBuf;

    pub const HOME_ENV: &str = "AGENTLINK_HOME";

    /// Returns the agentlink home directory.
    pub fn agentlink_home() -> PathBuf {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|h| !h.is_empty()) {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".agentlink"),
            |h| h.join(".config").join("agentlink"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        agentlink_home().join("config.toml")
    }

    /// Returns the directory for the file log.
    pub fn logs_dir() -> PathBuf {
        agentlink_home().join("logs")
    }

    /// The backend's transcript root, `~/.claude/projects`.
    pub fn default_projects_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".claude")
            .join("projects")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub executable: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub extra_args: Vec<String>,
    pub request_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub terminate_grace_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            executable: DEFAULT_EXECUTABLE.to_string(),
            model: None,
            extra_args: Vec::new(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT.as_secs(),
            terminate_grace_secs: DEFAULT_TERMINATE_GRACE.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projects_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub backend: BackendConfig,
    pub sessions: SessionsConfig,
    pub heuristics: ThinkingClassifier,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            backend: BackendConfig::default(),
            sessions: SessionsConfig::default(),
            heuristics: ThinkingClassifier::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the default config path, then applies
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&paths::config_path())?;
        if let Some(exe) = std::env::var_os(BACKEND_ENV).filter(|v| !v.is_empty()) {
            config.backend.executable = exe.to_string_lossy().to_string();
        }
        Ok(config)
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Creates a default config file at the given path.
    /// Returns an error if the file already exists.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        Self::write_config(path, default_config_template())
    }

    /// Writes config content to a file, creating parent directories as needed.
    /// Uses atomic write (temp file + rename) to prevent corruption.
    fn write_config(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.sessions
            .projects_dir
            .clone()
            .unwrap_or_else(paths::default_projects_dir)
    }

    pub fn session_store(&self) -> SessionStore {
        SessionStore::new(self.projects_dir())
    }

    /// Zero is treated as "use the default".
    pub fn request_timeout(&self) -> Duration {
        secs_or(self.backend.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn probe_timeout(&self) -> Duration {
        secs_or(self.backend.probe_timeout_secs, DEFAULT_PROBE_TIMEOUT)
    }

    pub fn subprocess_options(&self) -> SubprocessOptions {
        SubprocessOptions {
            executable: PathBuf::from(&self.backend.executable),
            model: self.backend.model.clone(),
            extra_args: self.backend.extra_args.clone(),
            timeout: self.request_timeout(),
            terminate_grace: Duration::from_secs(self.backend.terminate_grace_secs),
            classifier: self.heuristics.clone(),
        }
    }
}

fn secs_or(secs: u64, default: Duration) -> Duration {
    if secs == 0 {
        default
    } else {
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.backend.executable, "claude");
        assert_eq!(config.request_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn partial_config_merges_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[backend]\nmodel = \"opus\"\nrequest_timeout_secs = 30\n\n[heuristics]\nthinking_phrases = [\"hmm\"]\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.backend.model.as_deref(), Some("opus"));
        assert_eq!(config.backend.executable, "claude");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.heuristics.thinking_phrases, vec!["hmm"]);
        assert!(!config.heuristics.thinking_prefixes.is_empty());
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[backend\n").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config"));
    }

    #[test]
    fn template_matches_defaults() {
        let parsed: Config = toml::from_str(default_config_template()).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn init_creates_file_and_refuses_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        Config::init(&path).unwrap();
        assert!(path.exists());
        assert!(Config::init(&path).is_err());
    }

    #[test]
    fn subprocess_options_follow_config() {
        let mut config = Config::default();
        config.backend.executable = "/opt/bin/assistant".to_string();
        config.backend.extra_args = vec!["--debug".to_string()];
        config.backend.request_timeout_secs = 0;

        let options = config.subprocess_options();
        assert_eq!(options.executable, PathBuf::from("/opt/bin/assistant"));
        assert_eq!(options.extra_args, vec!["--debug"]);
        assert_eq!(options.timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(options.terminate_grace, Duration::from_secs(3));
    }

    #[test]
    fn projects_dir_override() {
        let mut config = Config::default();
        config.sessions.projects_dir = Some(PathBuf::from("/data/projects"));
        assert_eq!(
            config.session_store().projects_dir(),
            Path::new("/data/projects")
        );
    }
}
