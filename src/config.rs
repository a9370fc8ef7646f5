use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::pool::PoolConfig;
use crate::{Error, Result};

pub const LOCUS_DIR: &str = ".locus";
pub const CONFIG_FILE: &str = "config.toml";
pub const LOG_FILE: &str = "locus.log";
pub const API_KEY_ENV: &str = "LOCUS_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub url: String,
    pub workspace_id: String,
    pub api_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000/api".to_string(),
            workspace_id: String::new(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub count: usize,
    pub hard_cap: usize,
    pub roles: Vec<String>,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_tick_secs: u64,
    pub stale_timeout_secs: u64,
    pub stop_grace_secs: u64,
    /// Shell command to run as the worker instead of `locus worker`.
    pub worker_command: Option<String>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            count: 1,
            hard_cap: crate::pool::DEFAULT_HARD_CAP,
            roles: Vec::new(),
            heartbeat_interval_secs: 30,
            heartbeat_tick_secs: 60,
            stale_timeout_secs: 600,
            stop_grace_secs: 5,
            worker_command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub lock_ttl_secs: u64,
    /// Attempts per task within one run; `None` retries without limit.
    pub max_task_attempts: Option<u32>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 3600,
            max_task_attempts: Some(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub base_branch: String,
    pub branch_prefix: String,
    pub worktree_dir: String,
    pub push: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            branch_prefix: crate::worktree::DEFAULT_BRANCH_PREFIX.to_string(),
            worktree_dir: crate::worktree::DEFAULT_WORKTREE_DIR.to_string(),
            push: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub command: String,
    pub model: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            model: None,
            timeout_secs: crate::executor::DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub agents: AgentsConfig,
    pub dispatch: DispatchConfig,
    pub git: GitConfig,
    pub executor: ExecutorConfig,
}

impl Config {
    pub fn locus_dir(root: &Path) -> PathBuf {
        root.join(LOCUS_DIR)
    }

    pub fn config_path(root: &Path) -> PathBuf {
        Self::locus_dir(root).join(CONFIG_FILE)
    }

    pub fn log_path(root: &Path) -> PathBuf {
        Self::locus_dir(root).join(LOG_FILE)
    }

    /// Load `<root>/.locus/config.toml`, falling back to defaults when the
    /// file is absent. `LOCUS_API_KEY` wins over the file's key.
    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::config_path(root);
        debug!(path = %path.display(), "loading config");
        let mut config = if path.exists() {
            toml::from_str(&fs::read_to_string(&path)?)?
        } else {
            debug!("config file not found, using defaults");
            Self::default()
        };
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                config.api.api_key = Some(key);
            }
        }
        Ok(config)
    }

    /// Fail unless enough is configured to reach the task store.
    pub fn require_api(&self) -> Result<()> {
        if self.api.url.trim().is_empty() {
            return Err(Error::Config("api.url is not set".to_string()));
        }
        if self.api.workspace_id.trim().is_empty() {
            return Err(Error::Config("api.workspace_id is not set".to_string()));
        }
        Ok(())
    }

    /// Worktree directory as configured; relative paths are taken from the
    /// repository root by the caller.
    pub fn worktree_dir(&self) -> PathBuf {
        expand_tilde(&self.git.worktree_dir)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.dispatch.lock_ttl_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.agents.heartbeat_interval_secs.max(1))
    }

    pub fn executor_timeout(&self) -> Duration {
        Duration::from_secs(self.executor.timeout_secs.max(1))
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            agent_count: self.agents.count,
            hard_cap: self.agents.hard_cap,
            heartbeat_tick: Duration::from_secs(self.agents.heartbeat_tick_secs.max(1)),
            stale_timeout: Duration::from_secs(self.agents.stale_timeout_secs),
            stop_grace: Duration::from_secs(self.agents.stop_grace_secs),
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
