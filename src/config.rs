//! Runtime configuration.
//!
//! Loaded from `conductor.toml` in the project directory, with environment
//! overrides for the agent command. The repository topology lives here —
//! it is immutable configuration, read once per task.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::repository::Repository;
use crate::retry::RetryPolicy;

/// On-disk shape of `conductor.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub repositories: Vec<Repository>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Command used to invoke agents.
    #[serde(default = "default_agent_cmd")]
    pub agent_cmd: String,
    /// Per-invocation timeout in seconds.
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    /// Whether the review phase requires human approval before finishing.
    #[serde(default)]
    pub require_approval: bool,
}

fn default_agent_cmd() -> String {
    "claude".to_string()
}

fn default_agent_timeout_secs() -> u64 {
    1800
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agent_cmd: default_agent_cmd(),
            agent_timeout_secs: default_agent_timeout_secs(),
            require_approval: false,
        }
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    /// `.conductor/` — database, locks, logs.
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    pub lock_dir: PathBuf,
    pub agent_cmd: String,
    pub agent_timeout: Duration,
    pub require_approval: bool,
    pub repositories: Vec<Repository>,
    pub retry: RetryPolicy,
}

impl Config {
    /// Load configuration for a project directory.
    ///
    /// Reads `.env` (if present), then `conductor.toml`, then applies the
    /// `CONDUCTOR_AGENT_CMD` environment override.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let _ = dotenvy::from_path(project_dir.join(".env"));

        let config_path = project_dir.join("conductor.toml");
        let file: ConfigFile = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            ConfigFile::default()
        };

        let agent_cmd =
            std::env::var("CONDUCTOR_AGENT_CMD").unwrap_or(file.settings.agent_cmd);

        let state_dir = project_dir.join(".conductor");
        Ok(Self {
            db_path: state_dir.join("conductor.db"),
            lock_dir: state_dir.join("locks"),
            state_dir,
            project_dir,
            agent_cmd,
            agent_timeout: Duration::from_secs(file.settings.agent_timeout_secs),
            require_approval: file.settings.require_approval,
            repositories: file.repositories,
            retry: file.retry.unwrap_or_default(),
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).context("Failed to create state directory")?;
        std::fs::create_dir_all(&self.lock_dir).context("Failed to create lock directory")?;
        Ok(())
    }

    /// Repositories a task targets; an empty selection means all configured.
    pub fn repositories_for(&self, names: &[String]) -> Vec<Repository> {
        if names.is_empty() {
            return self.repositories.clone();
        }
        self.repositories
            .iter()
            .filter(|r| names.iter().any(|n| n == &r.name))
            .cloned()
            .collect()
    }
}
