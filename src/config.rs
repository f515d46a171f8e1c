//! Layered configuration for CodeMedic.
//!
//! Settings are read from `codemedic.toml` in the working directory, then
//! overridden by environment variables. Every section is optional; a missing
//! file yields pure defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [repo]
//! path = "/srv/checkouts/shop-backend"
//! primary_branch = "master"
//!
//! [log]
//! file_path = "/var/log/shop/app.log"
//!
//! [agent]
//! cmd = "opencode"
//! args = ["run", "--print-logs"]
//! model = "anthropic/claude-sonnet"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "codemedic.toml";

const DEFAULT_PRIMARY_BRANCH: &str = "master";
const DEFAULT_AGENT_CMD: &str = "opencode";

/// Runtime configuration, assembled from file + environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MedicConfig {
    pub repo: RepoConfig,
    pub log: LogConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Default repository checkout for CLI commands.
    pub path: Option<PathBuf>,
    /// The branch `sync` force-aligns with its remote counterpart.
    pub primary_branch: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default log file for `analyze` / `fix`.
    pub file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// External fixing-agent executable.
    pub cmd: String,
    /// Leading arguments placed before the prompt.
    pub args: Vec<String>,
    /// Default model forwarded to the agent via `--model`.
    pub model: Option<String>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            path: None,
            primary_branch: DEFAULT_PRIMARY_BRANCH.to_string(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cmd: DEFAULT_AGENT_CMD.to_string(),
            args: vec!["run".to_string(), "--print-logs".to_string()],
            model: None,
        }
    }
}

impl MedicConfig {
    /// Load configuration from `codemedic.toml` under `dir`, then apply
    /// environment overrides (`CODEMEDIC_AGENT_CMD`, `CODEMEDIC_PRIMARY_BRANCH`).
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(cmd) = std::env::var("CODEMEDIC_AGENT_CMD")
            && !cmd.is_empty()
        {
            config.agent.cmd = cmd;
        }
        if let Ok(branch) = std::env::var("CODEMEDIC_PRIMARY_BRANCH")
            && !branch.is_empty()
        {
            config.repo.primary_branch = branch;
        }

        Ok(config)
    }
}
