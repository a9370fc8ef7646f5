//! Run driver.
//!
//! A sprint run works through the sprint's open tasks one worker at a time on
//! a shared branch. A parallel run plans tiers and, round by round, lets up to
//! `capacity` workers compete for the runnable tasks. In both modes the
//! parent process is the only writer of the run state: it applies pool
//! events and persists after each one.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::dispatch::Dispatcher;
use crate::pool::{AgentOutcome, AgentPool, PoolEvent, SelfLauncher, ShellLauncher, WorkerLauncher};
use crate::run_state::{EntryStatus, RunKind, RunState, RunStateStore};
use crate::scheduler::{runnable, TierPlan};
use crate::store::TaskStore;
use crate::task::{Task, TaskFilter, TaskId};
use crate::worktree::WorktreeManager;
use crate::Result;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Interrupted,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Failed => 1,
            RunOutcome::Interrupted => 130,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Sprint {
        sprint_id: String,
    },
    Parallel {
        sprint_id: Option<String>,
        task_ids: Vec<TaskId>,
    },
}

/// Pick the worker launcher: the configured shell command if any,
/// otherwise this executable's `worker` subcommand.
pub fn launcher_for(ctx: &Context, global_args: Vec<String>) -> Result<Arc<dyn WorkerLauncher>> {
    Ok(match &ctx.config.agents.worker_command {
        Some(script) if !script.trim().is_empty() => Arc::new(ShellLauncher::new(script.clone())),
        _ => Arc::new(SelfLauncher::current(global_args)?),
    })
}

/// Arguments appended after `worker --agent-id <id> --index <n>`. Workers
/// load their own config, so a model override must travel on the command line.
pub fn worker_args(
    model: Option<&str>,
    sprint_id: Option<&str>,
    branch: Option<&str>,
    tasks: &[TaskId],
) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(model) = model {
        args.push("--model".to_string());
        args.push(model.to_string());
    }
    if let Some(sprint) = sprint_id {
        args.push("--sprint".to_string());
        args.push(sprint.to_string());
    }
    if let Some(branch) = branch {
        args.push("--branch".to_string());
        args.push(branch.to_string());
    }
    for task in tasks {
        args.push("--task".to_string());
        args.push(task.to_string());
    }
    args
}

/// What one wait on the pool observed.
#[derive(Debug, Default)]
struct RoundReport {
    started: usize,
}

pub struct Orchestrator {
    ctx: Context,
    store: Arc<dyn TaskStore>,
    dispatcher: Dispatcher,
    launcher: Arc<dyn WorkerLauncher>,
    worktrees: WorktreeManager,
    run_states: RunStateStore,
    next_index: usize,
}

impl Orchestrator {
    pub fn new(ctx: Context, store: Arc<dyn TaskStore>, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let dispatcher = ctx.dispatcher(store.clone());
        let worktrees = ctx.worktrees();
        let run_states = ctx.run_state_store();
        Self {
            ctx,
            store,
            dispatcher,
            launcher,
            worktrees,
            run_states,
            next_index: 0,
        }
    }

    pub fn run_states(&self) -> &RunStateStore {
        &self.run_states
    }

    fn new_pool(&self) -> (AgentPool, mpsc::Receiver<PoolEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut pool = AgentPool::new(
            self.ctx.config.pool_config(),
            self.launcher.clone(),
            self.ctx.clock.clone(),
            tx,
        );
        pool.start_heartbeat_monitor();
        (pool, rx)
    }

    fn cleanup_worktrees(&self) {
        match self.worktrees.cleanup_stale(&self.ctx.root) {
            Ok(0) => {}
            Ok(n) => info!(count = n, "removed stale worktrees"),
            Err(e) => warn!(error = %e, "worktree cleanup failed"),
        }
    }

    /// Run to completion, failure or cancellation.
    pub async fn run(&mut self, mode: &RunMode, token: &CancellationToken) -> Result<RunOutcome> {
        self.cleanup_worktrees();
        match mode {
            RunMode::Sprint { sprint_id } => self.run_sprint(sprint_id, token).await,
            RunMode::Parallel { sprint_id, task_ids } => {
                self.run_parallel(sprint_id.as_deref(), task_ids, token).await
            }
        }
    }

    async fn open_tasks(&self, sprint_id: Option<&str>, task_ids: &[TaskId]) -> Result<Vec<Task>> {
        let mut tasks = if task_ids.is_empty() {
            let filter = match sprint_id {
                Some(sprint) => TaskFilter::sprint(sprint),
                None => TaskFilter::default(),
            };
            self.store.list_tasks(&filter).await?
        } else {
            let mut tasks = Vec::with_capacity(task_ids.len());
            for id in task_ids {
                let task = self.store.get_task(id).await?;
                if sprint_id.map_or(true, |s| task.sprint_id.as_deref() == Some(s)) {
                    tasks.push(task);
                }
            }
            tasks
        };
        tasks.retain(|t| !t.status.is_terminal());
        Ok(tasks)
    }

    /// Resume the saved run when it is of the same kind and covers `refs`,
    /// otherwise start a fresh one.
    fn resume_or_start(&self, kind: RunKind, branch: Option<String>, refs: &[TaskId]) -> Result<RunState> {
        if let Some(mut state) = self.run_states.load()? {
            let tracked: HashSet<&TaskId> = state.tasks.iter().map(|e| &e.task).collect();
            if state.kind == kind && state.branch == branch && refs.iter().all(|r| tracked.contains(r)) {
                let recovered = state.recover_interrupted();
                info!(run = %state.run_id, recovered, "resuming run");
                self.run_states.save(&state)?;
                return Ok(state);
            }
            debug!(run = %state.run_id, "saved run does not match, starting a new one");
        }
        let state = RunState::new(kind, branch, refs);
        info!(run = %state.run_id, tasks = refs.len(), "starting run");
        self.run_states.save(&state)?;
        Ok(state)
    }

    async fn run_sprint(&mut self, sprint_id: &str, token: &CancellationToken) -> Result<RunOutcome> {
        let tasks = self.open_tasks(Some(sprint_id), &[]).await?;
        let refs: Vec<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
        let branch = self.ctx.sprint_branch(sprint_id);
        let mut state = self.resume_or_start(RunKind::Sprint, Some(branch.clone()), &refs)?;
        let max_attempts = self.ctx.config.dispatch.max_task_attempts;

        while !token.is_cancelled() {
            let Some(entry) = state.next_task_within(max_attempts) else {
                break;
            };
            let task = entry.task.clone();
            info!(task = %task, attempt = entry.attempts + 1, "next sprint task");

            let (mut pool, mut events) = self.new_pool();
            let args = worker_args(
                self.ctx.config.executor.model.as_deref(),
                Some(sprint_id),
                Some(&branch),
                std::slice::from_ref(&task),
            );
            self.spawn(&mut pool, &args).await?;
            let report = self.drive(&mut pool, &mut events, &mut state, token).await?;

            if report.started == 0 && !token.is_cancelled() {
                error!(task = %task, "worker did not start the task, stopping run");
                break;
            }
        }
        self.finish(&state, token, max_attempts)
    }

    async fn run_parallel(
        &mut self,
        sprint_id: Option<&str>,
        task_ids: &[TaskId],
        token: &CancellationToken,
    ) -> Result<RunOutcome> {
        let mut tasks = self.open_tasks(sprint_id, task_ids).await?;
        let plan = TierPlan::build(&tasks)?;
        plan.apply(&mut tasks);
        for (tier, ids) in plan.tiers() {
            debug!(tier, count = ids.len(), "tier planned");
        }
        let refs = plan.ordered_ids();
        let mut state = self.resume_or_start(RunKind::Parallel, None, &refs)?;
        let max_attempts = self.ctx.config.dispatch.max_task_attempts;

        while !token.is_cancelled() {
            let done = state.done_refs();
            let exhausted: HashSet<TaskId> = state
                .exhausted(max_attempts)
                .into_iter()
                .map(|e| e.task.clone())
                .collect();
            let candidates: Vec<TaskId> = runnable(&tasks, &done)
                .into_iter()
                .filter(|t| !exhausted.contains(&t.id))
                .map(|t| t.id.clone())
                .collect();
            if candidates.is_empty() {
                break;
            }

            let (mut pool, mut events) = self.new_pool();
            let workers = pool.capacity().min(candidates.len());
            info!(tasks = candidates.len(), workers, "starting round");
            let args = worker_args(
                self.ctx.config.executor.model.as_deref(),
                sprint_id,
                None,
                &candidates,
            );
            for _ in 0..workers {
                self.spawn(&mut pool, &args).await?;
            }
            let report = self.drive(&mut pool, &mut events, &mut state, token).await?;

            if report.started == 0 && !token.is_cancelled() {
                error!("no runnable task could be started, stopping run");
                break;
            }
        }
        self.finish(&state, token, max_attempts)
    }

    async fn spawn(&mut self, pool: &mut AgentPool, args: &[String]) -> Result<()> {
        let index = self.next_index;
        self.next_index += 1;
        pool.spawn(index, args).await?;
        Ok(())
    }

    /// Wait for the pool to drain while applying its events.
    async fn drive(
        &self,
        pool: &mut AgentPool,
        events: &mut mpsc::Receiver<PoolEvent>,
        state: &mut RunState,
        token: &CancellationToken,
    ) -> Result<RoundReport> {
        let mut report = RoundReport::default();
        {
            let wait = pool.wait_for_all(token);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    result = &mut wait => {
                        result?;
                        break;
                    }
                    Some(event) = events.recv() => self.apply_event(state, event, &mut report).await?,
                }
            }
        }
        while let Ok(event) = events.try_recv() {
            self.apply_event(state, event, &mut report).await?;
        }
        Ok(report)
    }

    async fn apply_event(&self, state: &mut RunState, event: PoolEvent, report: &mut RoundReport) -> Result<()> {
        let changed = match event {
            PoolEvent::TaskStarted { task_id, .. } => {
                report.started += 1;
                state.mark_in_progress(&task_id)
            }
            PoolEvent::TaskCompleted { task_id, pr, .. } => state.mark_done(&task_id, pr),
            PoolEvent::TaskFailed { task_id, error, .. } => state.mark_failed(&task_id, &error),
            PoolEvent::AgentStale {
                agent_id,
                task_id: Some(task_id),
                silent_for,
            } => {
                match self.dispatcher.release(&task_id, &agent_id).await {
                    Ok(true) => info!(task = %task_id, agent = %agent_id.short(), "released stale agent's lock"),
                    Ok(false) => debug!(task = %task_id, "stale agent no longer held the lock"),
                    Err(e) => warn!(task = %task_id, error = %e, "could not release stale agent's lock"),
                }
                let reason = format!("agent unresponsive for {}s", silent_for.as_secs());
                state.mark_failed(&task_id, &reason)
            }
            // A stale kill already recorded its own reason
            PoolEvent::AgentCompleted {
                outcome: AgentOutcome::Failed { exit_code },
                unfinished_task: Some(task_id),
                ..
            } if state
                .entry(&task_id)
                .is_some_and(|e| e.status == EntryStatus::InProgress) =>
            {
                let reason = match exit_code {
                    Some(code) => format!("worker exited with code {}", code),
                    None => "worker was killed".to_string(),
                };
                state.mark_failed(&task_id, &reason)
            }
            _ => false,
        };
        if changed {
            self.run_states.save(state)?;
        }
        Ok(())
    }

    fn finish(&self, state: &RunState, token: &CancellationToken, max_attempts: Option<u32>) -> Result<RunOutcome> {
        let stats = state.stats();
        if token.is_cancelled() {
            info!(run = %state.run_id, done = stats.done, total = stats.total, "run interrupted");
            return Ok(RunOutcome::Interrupted);
        }
        if state.is_complete() {
            info!(run = %state.run_id, total = stats.total, "run completed");
            self.run_states.clear()?;
            return Ok(RunOutcome::Completed);
        }
        for entry in state.exhausted(max_attempts) {
            warn!(task = %entry.task, attempts = entry.attempts, error = ?entry.error, "task gave up");
        }
        warn!(
            run = %state.run_id,
            done = stats.done,
            failed = stats.failed,
            pending = stats.pending,
            "run finished with unfinished tasks"
        );
        Ok(RunOutcome::Failed)
    }
}
