//! Task claiming with expiring locks.
//!
//! There is no local mutex: exclusivity comes from the store's conditional
//! update on `lockedBy`. Every write names the holder it expects to replace,
//! so of two agents racing for the same task exactly one update lands and
//! the loser re-selects from a fresh listing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::store::{StoreError, TaskStore};
use crate::task::{AgentId, Holder, LockUpdate, Task, TaskFilter, TaskId, TaskPatch, TaskStatus};
use crate::Result;

/// Default claim lifetime.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(3600);

/// Who is claiming, and which roles they can fill.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub id: AgentId,
    pub roles: Vec<String>,
}

impl AgentIdentity {
    pub fn new(id: AgentId) -> Self {
        Self {
            id,
            roles: Vec::new(),
        }
    }

    pub fn with_roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    fn fills(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }
}

/// Narrows which tasks an agent may claim.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    pub sprint_id: Option<String>,
    pub tier: Option<u32>,
    /// Explicit allow-list; `None` admits every task.
    pub task_ids: Option<HashSet<TaskId>>,
    pub exclude: HashSet<TaskId>,
}

impl ClaimFilter {
    pub fn sprint(sprint_id: &str) -> Self {
        Self {
            sprint_id: Some(sprint_id.to_string()),
            ..Default::default()
        }
    }

    pub fn only(ids: impl IntoIterator<Item = TaskId>) -> Self {
        Self {
            task_ids: Some(ids.into_iter().collect()),
            ..Default::default()
        }
    }

    fn admits(&self, task: &Task) -> bool {
        if let Some(tier) = self.tier {
            if task.effective_tier() != tier {
                return false;
            }
        }
        if let Some(ids) = &self.task_ids {
            if !ids.contains(&task.id) {
                return false;
            }
        }
        !self.exclude.contains(&task.id)
    }
}

/// How an attempt ended, as reported back to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed { pr: Option<String>, summary: String },
    Failed { error: String },
}

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    lock_ttl: Duration,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    fn expiry(&self) -> chrono::DateTime<chrono::Utc> {
        let ttl = chrono::Duration::from_std(self.lock_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        self.clock.now() + ttl
    }

    /// 0 = resume own live lock, 1 = role match, 2 = anything else.
    fn rank(task: &Task, agent: &AgentIdentity, now: chrono::DateTime<chrono::Utc>) -> u8 {
        if task.is_locked_by(&agent.id, now) {
            0
        } else if task
            .assignee_role
            .as_deref()
            .is_some_and(|role| agent.fills(role))
        {
            1
        } else {
            2
        }
    }

    /// Claim the best available task for `agent`.
    ///
    /// Returns `Ok(None)` when nothing is claimable. Store failures other
    /// than a lost race are returned to the caller.
    pub async fn claim(&self, agent: &AgentIdentity, filter: &ClaimFilter) -> Result<Option<Task>> {
        let mut lost: HashSet<TaskId> = HashSet::new();
        let list_filter = TaskFilter {
            sprint_id: filter.sprint_id.clone(),
            statuses: Vec::new(),
        };

        loop {
            let now = self.clock.now();
            let tasks = self.store.list_tasks(&list_filter).await?;

            let mut candidates: Vec<&Task> = tasks
                .iter()
                .filter(|t| filter.admits(t) && !lost.contains(&t.id))
                .filter(|t| !t.status.is_terminal() && t.status != TaskStatus::Blocked)
                .filter(|t| !t.has_live_lock(now) || t.is_locked_by(&agent.id, now))
                .collect();
            // Stable: equal ranks keep store order
            candidates.sort_by_key(|t| Self::rank(t, agent, now));

            let Some(chosen) = candidates.first() else {
                return Ok(None);
            };

            let patch = TaskPatch::status(TaskStatus::InProgress)
                .with_lock(LockUpdate::Acquire {
                    agent_id: agent.id.clone(),
                    expires_at: self.expiry(),
                })
                .expecting(Holder::of(chosen));

            match self.store.update_task(&chosen.id, &patch).await {
                Ok(task) => {
                    info!(agent = %agent.id.short(), task = %task.id, "claimed task");
                    return Ok(Some(task));
                }
                Err(StoreError::Conflict(_)) | Err(StoreError::NotFound(_)) => {
                    debug!(agent = %agent.id.short(), task = %chosen.id, "lost claim race, reselecting");
                    lost.insert(chosen.id.clone());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Clear the lock if `agent` still holds it. Returns whether it did.
    pub async fn release(&self, task_id: &TaskId, agent: &AgentId) -> Result<bool> {
        let patch = TaskPatch::default()
            .with_lock(LockUpdate::Clear)
            .expecting(Holder::Agent(agent.clone()));
        self.conditional(task_id, agent, patch, "released lock").await
    }

    /// Push the expiry of a held lock one TTL into the future.
    pub async fn renew(&self, task_id: &TaskId, agent: &AgentId) -> Result<bool> {
        let patch = TaskPatch::default()
            .with_lock(LockUpdate::Acquire {
                agent_id: agent.clone(),
                expires_at: self.expiry(),
            })
            .expecting(Holder::Agent(agent.clone()));
        self.conditional(task_id, agent, patch, "renewed lock").await
    }

    /// Record the outcome and drop the lock in one update.
    ///
    /// Completed tasks move to `IN_REVIEW`; failed ones go back to `BACKLOG`
    /// so they can be claimed again. A comment describing the outcome is
    /// added best-effort.
    pub async fn finish(&self, task_id: &TaskId, agent: &AgentId, outcome: &TaskOutcome) -> Result<bool> {
        let (status, comment) = match outcome {
            TaskOutcome::Completed { pr, summary } => {
                let mut text = if summary.is_empty() {
                    "Task completed.".to_string()
                } else {
                    summary.clone()
                };
                if let Some(pr) = pr {
                    text.push_str(&format!("\n\nPull request: {}", pr));
                }
                (TaskStatus::InReview, text)
            }
            TaskOutcome::Failed { error } => (TaskStatus::Backlog, format!("Attempt failed: {}", error)),
        };

        let patch = TaskPatch::status(status)
            .with_lock(LockUpdate::Clear)
            .expecting(Holder::Agent(agent.clone()));
        let applied = self.conditional(task_id, agent, patch, "finished task").await?;

        if applied {
            if let Err(e) = self.store.add_comment(task_id, agent.as_str(), &comment).await {
                warn!(task = %task_id, error = %e, "failed to add comment");
            }
        }
        Ok(applied)
    }

    async fn conditional(&self, task_id: &TaskId, agent: &AgentId, patch: TaskPatch, what: &str) -> Result<bool> {
        match self.store.update_task(task_id, &patch).await {
            Ok(_) => {
                debug!(agent = %agent.short(), task = %task_id, "{}", what);
                Ok(true)
            }
            Err(StoreError::Conflict(_)) => {
                debug!(agent = %agent.short(), task = %task_id, "lock no longer held");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
