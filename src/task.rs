//! Task data model shared with the external task store.
//!
//! The store owns tasks; the orchestrator only reads them and mutates the
//! status and lock fields. Field names follow the store's camelCase JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a task in the external store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a worker agent.
///
/// Generated once per worker incarnation and written into `lockedBy`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    /// Create a new unique agent identifier.
    pub fn generate() -> Self {
        Self(format!("agent-{}", &Uuid::new_v4().simple().to_string()[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return the last 8 characters for log prefixes.
    pub fn short(&self) -> &str {
        let len = self.0.len();
        &self.0[len.saturating_sub(8)..]
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Task status as stored in the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Backlog,
    InProgress,
    InReview,
    Done,
    Blocked,
}

impl TaskStatus {
    /// Terminal statuses are never dispatched again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::InReview | TaskStatus::Done)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "BACKLOG",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::InReview => "IN_REVIEW",
            TaskStatus::Done => "DONE",
            TaskStatus::Blocked => "BLOCKED",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A task as returned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub locked_by: Option<AgentId>,
    #[serde(default)]
    pub lock_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assignee_role: Option<String>,
    #[serde(default)]
    pub sprint_id: Option<String>,
    /// Dependency level assigned at planning time.
    #[serde(default)]
    pub tier: Option<u32>,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a backlog task with the given id and title.
    pub fn new(id: impl Into<String>, title: &str) -> Self {
        Self {
            id: TaskId::new(id),
            title: title.to_string(),
            description: String::new(),
            status: TaskStatus::Backlog,
            locked_by: None,
            lock_expires_at: None,
            assignee_role: None,
            sprint_id: None,
            tier: None,
            depends_on: Vec::new(),
            created_at: None,
        }
    }

    pub fn with_tier(mut self, tier: u32) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.assignee_role = Some(role.to_string());
        self
    }

    pub fn with_sprint(mut self, sprint_id: &str) -> Self {
        self.sprint_id = Some(sprint_id.to_string());
        self
    }

    pub fn depending_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| TaskId::from(*d)).collect();
        self
    }

    /// Tier used for scheduling; untiered tasks belong to tier 0.
    pub fn effective_tier(&self) -> u32 {
        self.tier.unwrap_or(0)
    }

    /// A lock is live only while `now < lockExpiresAt`.
    pub fn has_live_lock(&self, now: DateTime<Utc>) -> bool {
        match (&self.locked_by, self.lock_expires_at) {
            (Some(_), Some(expires)) => now < expires,
            // A holder without an expiry never expires on its own
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Whether `agent` holds a live lock on this task.
    pub fn is_locked_by(&self, agent: &AgentId, now: DateTime<Utc>) -> bool {
        self.locked_by.as_ref() == Some(agent) && self.has_live_lock(now)
    }
}

/// Filter passed to `TaskStore::list_tasks`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub sprint_id: Option<String>,
    pub statuses: Vec<TaskStatus>,
}

impl TaskFilter {
    pub fn sprint(sprint_id: &str) -> Self {
        Self {
            sprint_id: Some(sprint_id.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(sprint) = &self.sprint_id {
            if task.sprint_id.as_deref() != Some(sprint.as_str()) {
                return false;
            }
        }
        self.statuses.is_empty() || self.statuses.contains(&task.status)
    }
}

/// Lock field change carried by a `TaskPatch`.
#[derive(Debug, Clone, PartialEq)]
pub enum LockUpdate {
    Acquire {
        agent_id: AgentId,
        expires_at: DateTime<Utc>,
    },
    Clear,
}

/// Expected current holder for a compare-and-swap update.
#[derive(Debug, Clone, PartialEq)]
pub enum Holder {
    Nobody,
    Agent(AgentId),
}

impl Holder {
    pub fn of(task: &Task) -> Self {
        match &task.locked_by {
            Some(agent) => Holder::Agent(agent.clone()),
            None => Holder::Nobody,
        }
    }

    pub fn matches(&self, locked_by: Option<&AgentId>) -> bool {
        match self {
            Holder::Nobody => locked_by.is_none(),
            Holder::Agent(expected) => locked_by == Some(expected),
        }
    }
}

/// Partial update of a task.
///
/// When `expected_holder` is set the store must reject the update unless the
/// current `lockedBy` matches it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub lock: Option<LockUpdate>,
    pub expected_holder: Option<Holder>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_lock(mut self, lock: LockUpdate) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn expecting(mut self, holder: Holder) -> Self {
        self.expected_holder = Some(holder);
        self
    }

    /// Apply the patch to a task value (used by stores that hold tasks in memory).
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        match &self.lock {
            Some(LockUpdate::Acquire {
                agent_id,
                expires_at,
            }) => {
                task.locked_by = Some(agent_id.clone());
                task.lock_expires_at = Some(*expires_at);
            }
            Some(LockUpdate::Clear) => {
                task.locked_by = None;
                task.lock_expires_at = None;
            }
            None => {}
        }
    }
}
