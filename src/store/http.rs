//! HTTP client for the task store API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{StoreError, TaskStore};
use crate::task::{Holder, LockUpdate, Task, TaskFilter, TaskId, TaskPatch};

/// HTTP client for the task store REST endpoints.
pub struct HttpTaskStore {
    inner: reqwest::Client,
    base_url: String,
    workspace_id: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct TaskEnvelope {
    task: Task,
}

#[derive(Deserialize)]
struct TaskListEnvelope {
    tasks: Vec<Task>,
}

impl HttpTaskStore {
    pub fn new(base_url: &str, workspace_id: &str, api_key: Option<String>) -> Self {
        Self {
            inner: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            workspace_id: workspace_id.to_string(),
            api_key,
        }
    }

    fn tasks_url(&self) -> String {
        format!("{}/workspaces/{}/tasks", self.base_url, self.workspace_id)
    }

    fn task_url(&self, id: &TaskId) -> String {
        format!("{}/{}", self.tasks_url(), id)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn check(
        response: reqwest::Response,
        id: Option<&TaskId>,
    ) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let label = id.map(|i| i.to_string()).unwrap_or_default();
        match status {
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                Err(StoreError::Conflict(label))
            }
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(label)),
            _ => Err(StoreError::Status {
                code: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

/// Wire body for a task patch.
///
/// Absent keys leave a field untouched; `null` clears it.
pub fn patch_body(patch: &TaskPatch) -> Value {
    let mut body = Map::new();
    if let Some(status) = patch.status {
        body.insert("status".to_string(), json!(status));
    }
    match &patch.lock {
        Some(LockUpdate::Acquire {
            agent_id,
            expires_at,
        }) => {
            body.insert("lockedBy".to_string(), json!(agent_id));
            body.insert("lockExpiresAt".to_string(), json!(expires_at));
        }
        Some(LockUpdate::Clear) => {
            body.insert("lockedBy".to_string(), Value::Null);
            body.insert("lockExpiresAt".to_string(), Value::Null);
        }
        None => {}
    }
    match &patch.expected_holder {
        Some(Holder::Nobody) => {
            body.insert("expectedLockedBy".to_string(), Value::Null);
        }
        Some(Holder::Agent(agent)) => {
            body.insert("expectedLockedBy".to_string(), json!(agent));
        }
        None => {}
    }
    Value::Object(body)
}

#[async_trait]
impl TaskStore for HttpTaskStore {
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let url = self.tasks_url();
        debug!(url = %url, sprint = ?filter.sprint_id, "GET tasks");

        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(sprint) = &filter.sprint_id {
            query.push(("sprintId", sprint.clone()));
        }
        if !filter.statuses.is_empty() {
            let statuses: Vec<&str> = filter.statuses.iter().map(|s| s.as_str()).collect();
            query.push(("status", statuses.join(",")));
        }

        let response = self
            .authorized(self.inner.get(&url).query(&query))
            .send()
            .await?;
        let envelope: TaskListEnvelope = Self::check(response, None)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))?;

        // The server may ignore unknown filters; enforce them locally too
        Ok(envelope
            .tasks
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Task, StoreError> {
        let url = self.task_url(id);
        debug!(url = %url, "GET task");
        let response = self.authorized(self.inner.get(&url)).send().await?;
        let envelope: TaskEnvelope = Self::check(response, Some(id))
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        Ok(envelope.task)
    }

    async fn update_task(&self, id: &TaskId, patch: &TaskPatch) -> Result<Task, StoreError> {
        let url = self.task_url(id);
        let body = patch_body(patch);
        debug!(url = %url, body = %body, "PATCH task");
        let response = self
            .authorized(self.inner.patch(&url).json(&body))
            .send()
            .await?;
        let envelope: TaskEnvelope = Self::check(response, Some(id))
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        Ok(envelope.task)
    }

    async fn add_comment(&self, id: &TaskId, author: &str, text: &str) -> Result<(), StoreError> {
        let url = format!("{}/comments", self.task_url(id));
        debug!(url = %url, "POST comment");
        let response = self
            .authorized(
                self.inner
                    .post(&url)
                    .json(&json!({ "author": author, "text": text })),
            )
            .send()
            .await?;
        Self::check(response, Some(id)).await?;
        Ok(())
    }
}
