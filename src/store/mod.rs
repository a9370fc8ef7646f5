//! Task store interface.
//!
//! The store is the single source of truth for lock ownership. Everything
//! the orchestrator knows about who works on what comes from here; the
//! compare-and-swap on `lockedBy` is what keeps two agents off one task.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::task::{Task, TaskFilter, TaskId, TaskPatch};

pub use http::HttpTaskStore;
pub use memory::MemoryTaskStore;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The conditional update was rejected: someone else holds the lock.
    #[error("lock conflict on task {0}")]
    Conflict(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response {code}: {body}")]
    Status { code: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl StoreError {
    /// Transport failures and server-side errors may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            StoreError::Status { code, .. } => *code >= 500 || *code == 429,
            StoreError::Conflict(_) | StoreError::NotFound(_) | StoreError::Malformed(_) => false,
        }
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    async fn get_task(&self, id: &TaskId) -> Result<Task, StoreError>;

    /// Apply `patch`. Returns `StoreError::Conflict` when the patch carries an
    /// expected holder that does not match the current `lockedBy`.
    async fn update_task(&self, id: &TaskId, patch: &TaskPatch) -> Result<Task, StoreError>;

    async fn add_comment(&self, id: &TaskId, author: &str, text: &str) -> Result<(), StoreError>;
}
