//! The loop run inside each worker process.
//!
//! claim → prepare checkout → execute (renewing the lock) → report →
//! clean up → claim again, until nothing is claimable. Progress goes to the
//! parent over stdout via [`Reporter`]; logs go to stderr.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dispatch::{AgentIdentity, ClaimFilter, Dispatcher, TaskOutcome};
use crate::executor::{ExecutionResult, TaskExecutor};
use crate::git::GitRunner;
use crate::ipc::{Reporter, WorkerMessage};
use crate::task::Task;
use crate::worktree::WorktreeManager;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub agent: AgentIdentity,
    pub filter: ClaimFilter,
    pub base_branch: String,
    /// Work on this shared branch in the root checkout instead of a
    /// per-task worktree.
    pub sprint_branch: Option<String>,
    pub heartbeat_interval: Duration,
    pub renew_interval: Duration,
    pub push: bool,
    /// Attempts for a store call that fails with a retryable error.
    pub store_attempts: u32,
    pub retry_delay: Duration,
}

impl WorkerOptions {
    pub fn new(agent: AgentIdentity, filter: ClaimFilter) -> Self {
        Self {
            agent,
            filter,
            base_branch: "main".to_string(),
            sprint_branch: None,
            heartbeat_interval: Duration::from_secs(30),
            renew_interval: Duration::from_secs(30 * 60),
            push: true,
            store_attempts: 4,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub completed: u32,
    pub failed: u32,
}

impl WorkerSummary {
    /// 0 when no task failed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 {
            0
        } else {
            1
        }
    }
}

struct Checkout {
    path: PathBuf,
    branch: String,
    worktree: bool,
}

pub struct Worker {
    root: PathBuf,
    dispatcher: Dispatcher,
    worktrees: WorktreeManager,
    git: Arc<dyn GitRunner>,
    executor: Arc<dyn TaskExecutor>,
    reporter: Reporter,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(
        root: PathBuf,
        dispatcher: Dispatcher,
        worktrees: WorktreeManager,
        git: Arc<dyn GitRunner>,
        executor: Arc<dyn TaskExecutor>,
        reporter: Reporter,
        options: WorkerOptions,
    ) -> Self {
        Self {
            root,
            dispatcher,
            worktrees,
            git,
            executor,
            reporter,
            options,
        }
    }

    fn agent_short(&self) -> &str {
        self.options.agent.id.short()
    }

    async fn retrying<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.options.retry_delay;
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < self.options.store_attempts => {
                    warn!(agent = %self.agent_short(), attempt, error = %e, "{} failed, retrying", what);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Run until no task is left, the allow-list is exhausted, or `token`
    /// is cancelled.
    pub async fn run(&self, token: &CancellationToken) -> Result<WorkerSummary> {
        let heartbeat = token.child_token();
        self.reporter.heartbeat();
        {
            let reporter = self.reporter.clone();
            let stop = heartbeat.clone();
            let every = self.options.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticks = tokio::time::interval_at(Instant::now() + every, every);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticks.tick() => reporter.heartbeat(),
                    }
                }
            });
        }

        let result = self.work(token).await;
        heartbeat.cancel();
        result
    }

    async fn work(&self, token: &CancellationToken) -> Result<WorkerSummary> {
        let mut summary = WorkerSummary::default();
        let mut filter = self.options.filter.clone();
        let single = filter.task_ids.as_ref().is_some_and(|ids| ids.len() == 1);

        while !token.is_cancelled() {
            let claimed = self
                .retrying("claim", || self.dispatcher.claim(&self.options.agent, &filter))
                .await?;
            let Some(task) = claimed else {
                info!(agent = %self.agent_short(), "no claimable tasks left");
                break;
            };

            self.reporter.send(&WorkerMessage::TaskStarted {
                task_id: task.id.clone(),
            });

            let attempt = match self.prepare_checkout(&task) {
                Ok(checkout) => {
                    let result = self.execute_with_renewal(&task, &checkout.path, token).await;
                    Some((checkout, result))
                }
                Err(e) => {
                    error!(agent = %self.agent_short(), task = %task.id, error = %e, "checkout failed");
                    self.report_failure(&task, &e.to_string(), &mut summary).await;
                    filter.exclude.insert(task.id.clone());
                    None
                }
            };

            if let Some((checkout, result)) = attempt {
                match result {
                    Ok(Some(ExecutionResult {
                        success: true,
                        summary: text,
                        pr,
                    })) => {
                        if self.options.push {
                            self.push(&checkout);
                        }
                        let outcome = TaskOutcome::Completed {
                            pr: pr.clone(),
                            summary: text,
                        };
                        self.finish(&task, &outcome).await;
                        summary.completed += 1;
                        self.reporter.send(&WorkerMessage::TaskCompleted {
                            task_id: task.id.clone(),
                            pr,
                        });
                    }
                    Ok(Some(ExecutionResult { summary: text, .. })) => {
                        self.report_failure(&task, &text, &mut summary).await;
                        filter.exclude.insert(task.id.clone());
                    }
                    Ok(None) => {
                        // Cancelled mid-task: hand the task back untouched
                        info!(agent = %self.agent_short(), task = %task.id, "interrupted, releasing task");
                        self.release(&task).await;
                    }
                    Err(e) => {
                        self.report_failure(&task, &e.to_string(), &mut summary).await;
                        filter.exclude.insert(task.id.clone());
                    }
                }
                if checkout.worktree {
                    self.worktrees.remove(&self.root, task.id.as_str());
                }
            }

            self.reporter.send(&WorkerMessage::Stats {
                tasks_completed: summary.completed,
                tasks_failed: summary.failed,
            });

            if single {
                break;
            }
        }
        Ok(summary)
    }

    fn prepare_checkout(&self, task: &Task) -> Result<Checkout> {
        match &self.options.sprint_branch {
            Some(branch) => {
                if self.git.run_checked(&self.root, &["checkout", branch]).is_err() {
                    self.git.run_checked(
                        &self.root,
                        &["checkout", "-b", branch, &self.options.base_branch],
                    )?;
                }
                Ok(Checkout {
                    path: self.root.clone(),
                    branch: branch.clone(),
                    worktree: false,
                })
            }
            None => {
                let info = self
                    .worktrees
                    .create_fresh(&self.root, task.id.as_str(), &self.options.base_branch)?;
                Ok(Checkout {
                    path: info.path,
                    branch: info.branch,
                    worktree: true,
                })
            }
        }
    }

    /// Execute while periodically renewing the lock. `Ok(None)` means the
    /// token was cancelled before the executor finished.
    async fn execute_with_renewal(
        &self,
        task: &Task,
        checkout: &Path,
        token: &CancellationToken,
    ) -> Result<Option<ExecutionResult>> {
        let execution = self.executor.execute(task, checkout);
        tokio::pin!(execution);
        let every = self.options.renew_interval;
        let mut renew = tokio::time::interval_at(Instant::now() + every, every);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut execution => return result.map(Some),
                _ = token.cancelled() => return Ok(None),
                _ = renew.tick() => {
                    match self.dispatcher.renew(&task.id, &self.options.agent.id).await {
                        Ok(true) => {}
                        Ok(false) => warn!(agent = %self.agent_short(), task = %task.id, "lock lost while executing"),
                        Err(e) => warn!(agent = %self.agent_short(), task = %task.id, error = %e, "lock renewal failed"),
                    }
                }
            }
        }
    }

    fn push(&self, checkout: &Checkout) {
        let path = &checkout.path;
        if let Err(e) = self
            .git
            .run_checked(path, &["push", "-u", "origin", &checkout.branch])
        {
            warn!(agent = %self.agent_short(), branch = %checkout.branch, error = %e, "push failed");
        }
    }

    async fn report_failure(&self, task: &Task, error: &str, summary: &mut WorkerSummary) {
        warn!(agent = %self.agent_short(), task = %task.id, error = %error, "task failed");
        let outcome = TaskOutcome::Failed {
            error: error.to_string(),
        };
        self.finish(task, &outcome).await;
        summary.failed += 1;
        self.reporter.send(&WorkerMessage::TaskFailed {
            task_id: task.id.clone(),
            error: error.to_string(),
        });
    }

    async fn finish(&self, task: &Task, outcome: &TaskOutcome) {
        let agent = &self.options.agent.id;
        match self
            .retrying("finish", || self.dispatcher.finish(&task.id, agent, outcome))
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(agent = %self.agent_short(), task = %task.id, "lock was lost before finishing"),
            Err(e) => {
                error!(agent = %self.agent_short(), task = %task.id, error = %e, "could not record outcome");
                self.release(task).await;
            }
        }
    }

    async fn release(&self, task: &Task) {
        let agent = &self.options.agent.id;
        if let Err(e) = self
            .retrying("release", || self.dispatcher.release(&task.id, agent))
            .await
        {
            error!(agent = %self.agent_short(), task = %task.id, error = %e, "could not release lock");
        }
    }
}

impl From<&crate::context::Context> for WorkerOptions {
    fn from(ctx: &crate::context::Context) -> Self {
        let agent = AgentIdentity {
            id: crate::task::AgentId::generate(),
            roles: ctx.config.agents.roles.clone(),
        };
        let mut options = Self::new(agent, ClaimFilter::default());
        options.base_branch = ctx.config.git.base_branch.clone();
        options.heartbeat_interval = ctx.config.heartbeat_interval();
        options.renew_interval = (ctx.config.lock_ttl() / 2).max(Duration::from_secs(1));
        options.push = ctx.config.git.push;
        options
    }
}

/// Maps a fatal worker error to a process exit code.
pub fn exit_code(result: &Result<WorkerSummary>) -> i32 {
    match result {
        Ok(summary) => summary.exit_code(),
        Err(Error::AgentNotAvailable(_)) => 2,
        Err(_) => 1,
    }
}
