use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Task store error: {0}")]
    Store(#[from] StoreError),

    #[error("git {command} failed: {stderr}")]
    GitCommand { command: String, stderr: String },

    #[error("Failed to create worktree for {task_ref}: {reason}")]
    WorktreeCreate { task_ref: String, reason: String },

    #[error("Failed to spawn worker {index}: {reason}")]
    WorkerSpawn { index: usize, reason: String },

    #[error("Agent pool is full (max: {max})")]
    AgentPoolFull { max: usize },

    #[error("Agent not found: {id}")]
    AgentNotFound { id: crate::task::AgentId },

    #[error("Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dependency cycle between tasks: {0}")]
    DependencyCycle(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store(e) => e.is_retryable(),
            Error::Timeout(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
