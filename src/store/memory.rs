//! In-memory task store with the same compare-and-swap contract as the
//! real service. Used for tests and local dry runs.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{StoreError, TaskStore};
use crate::task::{Task, TaskFilter, TaskId, TaskPatch};

#[derive(Debug, Clone, PartialEq)]
pub struct Comment {
    pub task_id: TaskId,
    pub author: String,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<Vec<Task>>,
    comments: Mutex<Vec<Comment>>,
}

impl MemoryTaskStore {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
            comments: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of a task, if present.
    pub fn snapshot(&self, id: &str) -> Option<Task> {
        self.lock_tasks().iter().find(|t| t.id.as_str() == id).cloned()
    }

    pub fn comments(&self) -> Vec<Comment> {
        self.comments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<Task>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let tasks: Vec<Task> = self
            .lock_tasks()
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        // Give concurrent callers a chance to interleave like a network round-trip would
        tokio::task::yield_now().await;
        Ok(tasks)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Task, StoreError> {
        self.lock_tasks()
            .iter()
            .find(|t| &t.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update_task(&self, id: &TaskId, patch: &TaskPatch) -> Result<Task, StoreError> {
        let mut tasks = self.lock_tasks();
        let task = tasks
            .iter_mut()
            .find(|t| &t.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if let Some(expected) = &patch.expected_holder {
            if !expected.matches(task.locked_by.as_ref()) {
                return Err(StoreError::Conflict(id.to_string()));
            }
        }

        patch.apply_to(task);
        Ok(task.clone())
    }

    async fn add_comment(&self, id: &TaskId, author: &str, text: &str) -> Result<(), StoreError> {
        if !self.lock_tasks().iter().any(|t| &t.id == id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.comments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Comment {
                task_id: id.clone(),
                author: author.to_string(),
                text: text.to_string(),
            });
        Ok(())
    }
}
