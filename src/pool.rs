//! Agent pool: worker process supervision.
//!
//! Every agent is an OS process in its own process group. The pool reads
//! the workers' stdout for IPC messages, relays everything else to the log,
//! watches heartbeats, and tears whole process trees down on shutdown or
//! when an agent goes silent. Entries leave the pool once their exit has
//! been observed, or when a process still has not exited a grace period
//! after SIGKILL; such an agent is abandoned and reported as interrupted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::ipc::WorkerMessage;
use crate::task::{AgentId, TaskId};
use crate::{Error, Result};

pub const DEFAULT_HARD_CAP: usize = 5;
pub const DEFAULT_HEARTBEAT_TICK: Duration = Duration::from_secs(60);
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for a dead worker's pipes to drain before reporting the exit.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub agent_count: usize,
    pub hard_cap: usize,
    pub heartbeat_tick: Duration,
    pub stale_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            agent_count: 1,
            hard_cap: DEFAULT_HARD_CAP,
            heartbeat_tick: DEFAULT_HEARTBEAT_TICK,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

impl PoolConfig {
    /// `min(max(agent_count, 1), hard_cap)`.
    pub fn capacity(&self) -> usize {
        self.agent_count.max(1).min(self.hard_cap.max(1))
    }
}

/// Builds the command that starts one worker.
pub trait WorkerLauncher: Send + Sync {
    fn command(&self, agent_id: &AgentId, index: usize, args: &[String]) -> Command;
}

/// Re-invokes the current executable's `worker` subcommand.
#[derive(Debug, Clone)]
pub struct SelfLauncher {
    exe: PathBuf,
    global_args: Vec<String>,
}

impl SelfLauncher {
    pub fn new(exe: PathBuf, global_args: Vec<String>) -> Self {
        Self { exe, global_args }
    }

    pub fn current(global_args: Vec<String>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, global_args))
    }
}

impl WorkerLauncher for SelfLauncher {
    fn command(&self, agent_id: &AgentId, index: usize, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.args(&self.global_args)
            .arg("worker")
            .arg("--agent-id")
            .arg(agent_id.as_str())
            .arg("--index")
            .arg(index.to_string())
            .args(args);
        cmd
    }
}

/// Runs a shell snippet as the worker. The agent id and index are exported
/// as `LOCUS_AGENT_ID` / `LOCUS_AGENT_INDEX`; extra args become `$1..`.
#[derive(Debug, Clone)]
pub struct ShellLauncher {
    script: String,
}

impl ShellLauncher {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl WorkerLauncher for ShellLauncher {
    fn command(&self, agent_id: &AgentId, index: usize, args: &[String]) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.script)
            .arg("locus-worker")
            .args(args)
            .env("LOCUS_AGENT_ID", agent_id.as_str())
            .env("LOCUS_AGENT_INDEX", index.to_string());
        cmd
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Idle,
    Working,
    Completed,
    Failed,
}

/// Pool-side view of one worker. Never persisted.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub id: AgentId,
    pub index: usize,
    pub status: AgentStatus,
    pub current_task: Option<TaskId>,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub pid: Option<u32>,
    /// Set once a stop was requested, so the exit is reported as interrupted.
    pub stopping: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Completed,
    Failed { exit_code: Option<i32> },
    Interrupted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    AgentSpawned {
        agent_id: AgentId,
        index: usize,
    },
    AgentWorking {
        agent_id: AgentId,
    },
    TaskStarted {
        agent_id: AgentId,
        task_id: TaskId,
    },
    TaskCompleted {
        agent_id: AgentId,
        task_id: TaskId,
        pr: Option<String>,
    },
    TaskFailed {
        agent_id: AgentId,
        task_id: TaskId,
        error: String,
    },
    AgentStale {
        agent_id: AgentId,
        task_id: Option<TaskId>,
        silent_for: Duration,
    },
    AgentCompleted {
        agent_id: AgentId,
        index: usize,
        outcome: AgentOutcome,
        tasks_completed: u32,
        tasks_failed: u32,
        /// Task the worker started but never reported on.
        unfinished_task: Option<TaskId>,
    },
}

#[derive(Debug)]
enum WorkerSignal {
    Stdout { agent_id: AgentId, line: String },
    Stderr { agent_id: AgentId, line: String },
    Exited { agent_id: AgentId, code: Option<i32> },
}

#[derive(Debug, Clone, Copy)]
enum StopSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: StopSignal) -> std::io::Result<()> {
    let sig = match signal {
        StopSignal::Terminate => libc::SIGTERM,
        StopSignal::Kill => libc::SIGKILL,
    };
    // The worker was started with process_group(0), so its pgid is its pid
    let result = unsafe { libc::killpg(pid as libc::pid_t, sig) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: StopSignal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process groups are only supported on unix",
    ))
}

enum Step {
    Signal(WorkerSignal),
    Tick,
    Cancelled,
}

pub struct AgentPool {
    config: PoolConfig,
    launcher: Arc<dyn WorkerLauncher>,
    clock: Arc<dyn Clock>,
    agents: HashMap<AgentId, AgentState>,
    event_tx: mpsc::Sender<PoolEvent>,
    signal_tx: mpsc::UnboundedSender<WorkerSignal>,
    signal_rx: mpsc::UnboundedReceiver<WorkerSignal>,
    ticker: Option<Interval>,
}

impl AgentPool {
    /// Create a pool that reports lifecycle changes on `event_tx`.
    ///
    /// # Arguments
    ///
    /// * `config` - Capacity and timing parameters
    /// * `launcher` - Builds the worker command
    /// * `clock` - Time source for heartbeat staleness
    /// * `event_tx` - Channel sender for pool events
    pub fn new(
        config: PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
        clock: Arc<dyn Clock>,
        event_tx: mpsc::Sender<PoolEvent>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Self {
            config,
            launcher,
            clock,
            agents: HashMap::new(),
            event_tx,
            signal_tx,
            signal_rx,
            ticker: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity()
    }

    pub fn active_count(&self) -> usize {
        self.agents.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn get(&self, id: &AgentId) -> Option<&AgentState> {
        self.agents.get(id)
    }

    async fn emit(&self, event: PoolEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("pool event receiver dropped");
        }
    }

    /// Launch one worker.
    ///
    /// # Errors
    ///
    /// `Error::AgentPoolFull` at capacity, `Error::WorkerSpawn` when the
    /// process cannot be started.
    pub async fn spawn(&mut self, index: usize, args: &[String]) -> Result<AgentId> {
        if !self.has_capacity() {
            return Err(Error::AgentPoolFull {
                max: self.capacity(),
            });
        }

        let agent_id = AgentId::generate();
        let mut cmd = self.launcher.command(&agent_id, index, args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| Error::WorkerSpawn {
            index,
            reason: e.to_string(),
        })?;
        let pid = child.id();

        let stdout_task = child.stdout.take().map(|out| {
            let tx = self.signal_tx.clone();
            let agent_id = agent_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx.send(WorkerSignal::Stdout {
                        agent_id: agent_id.clone(),
                        line,
                    });
                }
            })
        });
        let stderr_task = child.stderr.take().map(|err| {
            let tx = self.signal_tx.clone();
            let agent_id = agent_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx.send(WorkerSignal::Stderr {
                        agent_id: agent_id.clone(),
                        line,
                    });
                }
            })
        });

        {
            let tx = self.signal_tx.clone();
            let agent_id = agent_id.clone();
            tokio::spawn(async move {
                let code = match child.wait().await {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!(agent = %agent_id.short(), error = %e, "failed to wait for worker");
                        None
                    }
                };
                // Report the exit only after the pipes are read, so final
                // messages are not lost
                for task in [stdout_task, stderr_task].into_iter().flatten() {
                    let _ = tokio::time::timeout(PIPE_DRAIN_TIMEOUT, task).await;
                }
                let _ = tx.send(WorkerSignal::Exited { agent_id, code });
            });
        }

        self.agents.insert(
            agent_id.clone(),
            AgentState {
                id: agent_id.clone(),
                index,
                status: AgentStatus::Idle,
                current_task: None,
                tasks_completed: 0,
                tasks_failed: 0,
                last_heartbeat: self.clock.now(),
                pid,
                stopping: false,
            },
        );
        info!(agent = %agent_id.short(), index, pid = ?pid, "agent spawned");
        self.emit(PoolEvent::AgentSpawned {
            agent_id: agent_id.clone(),
            index,
        })
        .await;
        Ok(agent_id)
    }

    /// Arm the periodic heartbeat check.
    pub fn start_heartbeat_monitor(&mut self) {
        let tick = self.config.heartbeat_tick;
        let mut interval = tokio::time::interval_at(Instant::now() + tick, tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(interval);
    }

    /// Kill every working agent that has been silent longer than the stale
    /// timeout. Returns the agents that were killed.
    pub async fn check_heartbeats(&mut self) -> Vec<AgentId> {
        let now = self.clock.now();
        let threshold = chrono::Duration::from_std(self.config.stale_timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));

        let stale: Vec<AgentId> = self
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Working && !a.stopping)
            .filter(|a| now - a.last_heartbeat > threshold)
            .map(|a| a.id.clone())
            .collect();

        for id in &stale {
            let Some(agent) = self.agents.get_mut(id) else {
                continue;
            };
            let silent_for = (now - agent.last_heartbeat).to_std().unwrap_or_default();
            warn!(
                agent = %id.short(),
                task = ?agent.current_task,
                silent_secs = silent_for.as_secs(),
                "agent stale, killing"
            );
            if let Some(pid) = agent.pid {
                if let Err(e) = signal_group(pid, StopSignal::Kill) {
                    error!(agent = %id.short(), error = %e, "failed to kill stale agent");
                }
            }
            agent.status = AgentStatus::Failed;
            let event = PoolEvent::AgentStale {
                agent_id: id.clone(),
                task_id: agent.current_task.clone(),
                silent_for,
            };
            self.emit(event).await;
        }
        stale
    }

    async fn handle_signal(&mut self, signal: WorkerSignal) {
        match signal {
            WorkerSignal::Stdout { agent_id, line } => match WorkerMessage::parse(&line) {
                Some(message) => self.handle_message(agent_id, message).await,
                None => info!(agent = %agent_id.short(), "{}", line),
            },
            WorkerSignal::Stderr { agent_id, line } => {
                info!(agent = %agent_id.short(), "{}", line);
            }
            WorkerSignal::Exited { agent_id, code } => self.handle_exit(agent_id, code).await,
        }
    }

    async fn handle_message(&mut self, agent_id: AgentId, message: WorkerMessage) {
        let now = self.clock.now();
        let Some(agent) = self.agents.get_mut(&agent_id) else {
            return;
        };
        agent.last_heartbeat = now;

        let mut events = Vec::new();
        if agent.status == AgentStatus::Idle {
            agent.status = AgentStatus::Working;
            events.push(PoolEvent::AgentWorking {
                agent_id: agent_id.clone(),
            });
        }

        match message {
            WorkerMessage::Heartbeat => {}
            WorkerMessage::Stats {
                tasks_completed,
                tasks_failed,
            } => {
                agent.tasks_completed = tasks_completed;
                agent.tasks_failed = tasks_failed;
            }
            WorkerMessage::TaskStarted { task_id } => {
                info!(agent = %agent_id.short(), task = %task_id, "task started");
                agent.current_task = Some(task_id.clone());
                events.push(PoolEvent::TaskStarted { agent_id, task_id });
            }
            WorkerMessage::TaskCompleted { task_id, pr } => {
                info!(agent = %agent_id.short(), task = %task_id, pr = ?pr, "task completed");
                agent.tasks_completed += 1;
                if agent.current_task.as_ref() == Some(&task_id) {
                    agent.current_task = None;
                }
                events.push(PoolEvent::TaskCompleted {
                    agent_id,
                    task_id,
                    pr,
                });
            }
            WorkerMessage::TaskFailed { task_id, error } => {
                warn!(agent = %agent_id.short(), task = %task_id, error = %error, "task failed");
                agent.tasks_failed += 1;
                if agent.current_task.as_ref() == Some(&task_id) {
                    agent.current_task = None;
                }
                events.push(PoolEvent::TaskFailed {
                    agent_id,
                    task_id,
                    error,
                });
            }
        }

        for event in events {
            self.emit(event).await;
        }
    }

    async fn handle_exit(&mut self, agent_id: AgentId, code: Option<i32>) {
        let Some(agent) = self.agents.remove(&agent_id) else {
            return;
        };

        let outcome = if agent.stopping {
            AgentOutcome::Interrupted
        } else if code == Some(0) && agent.status != AgentStatus::Failed {
            AgentOutcome::Completed
        } else {
            AgentOutcome::Failed { exit_code: code }
        };
        let status = match outcome {
            AgentOutcome::Completed => AgentStatus::Completed,
            _ => AgentStatus::Failed,
        };
        info!(
            agent = %agent_id.short(),
            code = ?code,
            status = ?status,
            completed = agent.tasks_completed,
            failed = agent.tasks_failed,
            "agent exited"
        );

        self.emit(PoolEvent::AgentCompleted {
            agent_id,
            index: agent.index,
            outcome,
            tasks_completed: agent.tasks_completed,
            tasks_failed: agent.tasks_failed,
            unfinished_task: agent.current_task,
        })
        .await;
    }

    /// Process at most one pending worker signal, waiting up to `limit`.
    /// Returns whether a signal was handled.
    pub async fn pump(&mut self, limit: Duration) -> bool {
        match tokio::time::timeout(limit, self.signal_rx.recv()).await {
            Ok(Some(signal)) => {
                self.handle_signal(signal).await;
                true
            }
            _ => false,
        }
    }

    async fn next_tick(ticker: &mut Option<Interval>) {
        match ticker {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Drive the pool until every agent has exited or `token` is cancelled.
    /// Cancellation shuts the pool down before returning.
    pub async fn wait_for_all(&mut self, token: &CancellationToken) -> Result<()> {
        while !self.agents.is_empty() {
            let step = tokio::select! {
                biased;
                _ = token.cancelled() => Step::Cancelled,
                signal = self.signal_rx.recv() => match signal {
                    Some(signal) => Step::Signal(signal),
                    // The pool holds a sender, so the channel never closes
                    None => continue,
                },
                _ = Self::next_tick(&mut self.ticker) => Step::Tick,
            };

            match step {
                Step::Signal(signal) => self.handle_signal(signal).await,
                Step::Tick => {
                    self.check_heartbeats().await;
                }
                Step::Cancelled => {
                    info!("cancellation requested, stopping agents");
                    self.shutdown().await;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Pump signals until `done` holds or `deadline` passes.
    async fn drain_until(&mut self, deadline: Instant, done: impl Fn(&Self) -> bool) -> bool {
        while !done(&*self) {
            match tokio::time::timeout_at(deadline, self.signal_rx.recv()).await {
                Ok(Some(signal)) => self.handle_signal(signal).await,
                Ok(None) | Err(_) => return done(&*self),
            }
        }
        true
    }

    fn send_stop(&mut self, id: &AgentId, signal: StopSignal) {
        if let Some(agent) = self.agents.get_mut(id) {
            agent.stopping = true;
            if let Some(pid) = agent.pid {
                if let Err(e) = signal_group(pid, signal) {
                    warn!(agent = %id.short(), error = %e, "failed to signal agent");
                }
            }
        }
    }

    /// Remove agents whose exit never arrived, reporting them as interrupted.
    async fn abandon_remaining(&mut self) {
        let remaining: Vec<AgentId> = self.agents.keys().cloned().collect();
        for id in remaining {
            error!(agent = %id.short(), "agent did not exit after SIGKILL");
            self.handle_exit(id, None).await;
        }
    }

    /// Stop one agent: SIGTERM to its process group, SIGKILL after the grace
    /// period. Returns once the exit has been observed.
    pub async fn stop_agent(&mut self, id: &AgentId) -> Result<()> {
        if !self.agents.contains_key(id) {
            return Err(Error::AgentNotFound { id: id.clone() });
        }
        let grace = self.config.stop_grace;

        self.send_stop(id, StopSignal::Terminate);
        let gone = |pool: &Self| !pool.agents.contains_key(id);
        if self.drain_until(Instant::now() + grace, gone).await {
            return Ok(());
        }

        warn!(agent = %id.short(), "agent ignored SIGTERM, killing");
        self.send_stop(id, StopSignal::Kill);
        if !self.drain_until(Instant::now() + grace, gone).await {
            if self.agents.contains_key(id) {
                error!(agent = %id.short(), "agent did not exit after SIGKILL");
                self.handle_exit(id.clone(), None).await;
            }
        }
        Ok(())
    }

    /// Stop every agent. SIGTERM first, SIGKILL for whatever is left after
    /// the grace period.
    pub async fn shutdown(&mut self) {
        if self.agents.is_empty() {
            return;
        }
        let grace = self.config.stop_grace;
        let ids: Vec<AgentId> = self.agents.keys().cloned().collect();
        info!(count = ids.len(), "shutting down agents");

        for id in &ids {
            self.send_stop(id, StopSignal::Terminate);
        }
        if self.drain_until(Instant::now() + grace, |p| p.agents.is_empty()).await {
            return;
        }

        let survivors: Vec<AgentId> = self.agents.keys().cloned().collect();
        for id in &survivors {
            warn!(agent = %id.short(), "agent ignored SIGTERM, killing");
            self.send_stop(id, StopSignal::Kill);
        }
        if !self.drain_until(Instant::now() + grace, |p| p.agents.is_empty()).await {
            self.abandon_remaining().await;
        }
        self.ticker = None;
    }
}
