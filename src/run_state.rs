//! Run progress tracking.
//!
//! A `RunState` is the orchestrator's record of one sprint or parallel run:
//! the ordered task list and where each entry stands. It is pure data;
//! `RunStateStore` is the only thing that touches the disk, and the
//! orchestrator process is its only writer.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::task::TaskId;
use crate::Result;

pub const RUN_STATE_FILE: &str = "run-state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Sprint,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEntry {
    pub task: TaskId,
    pub order: usize,
    #[serde(default)]
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// How many times the entry has been started.
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub total: usize,
    pub done: usize,
    pub in_progress: usize,
    pub failed: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub run_id: String,
    #[serde(rename = "type")]
    pub kind: RunKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub tasks: Vec<TaskEntry>,
    pub started_at: DateTime<Utc>,
}

impl RunState {
    /// Start tracking `refs` in the given order; every entry begins pending.
    pub fn new(kind: RunKind, branch: Option<String>, refs: &[TaskId]) -> Self {
        let started_at = Utc::now();
        Self {
            run_id: format!("run-{}", started_at.format("%Y%m%d-%H%M%S-%3f")),
            kind,
            branch,
            tasks: refs
                .iter()
                .enumerate()
                .map(|(i, task)| TaskEntry {
                    task: task.clone(),
                    order: i + 1,
                    status: EntryStatus::Pending,
                    pr: None,
                    error: None,
                    completed_at: None,
                    failed_at: None,
                    attempts: 0,
                })
                .collect(),
            started_at,
        }
    }

    pub fn entry(&self, task: &TaskId) -> Option<&TaskEntry> {
        self.tasks.iter().find(|e| &e.task == task)
    }

    fn entry_mut(&mut self, task: &TaskId) -> Option<&mut TaskEntry> {
        self.tasks.iter_mut().find(|e| &e.task == task)
    }

    /// `pending|failed → in_progress`. Returns false for unknown or finished
    /// entries.
    pub fn mark_in_progress(&mut self, task: &TaskId) -> bool {
        let Some(entry) = self.entry_mut(task) else {
            return false;
        };
        match entry.status {
            EntryStatus::Pending | EntryStatus::Failed => {
                entry.status = EntryStatus::InProgress;
                entry.attempts += 1;
                entry.error = None;
                entry.failed_at = None;
                true
            }
            EntryStatus::InProgress => true,
            EntryStatus::Done => false,
        }
    }

    /// `in_progress → done`.
    pub fn mark_done(&mut self, task: &TaskId, pr: Option<String>) -> bool {
        let Some(entry) = self.entry_mut(task) else {
            return false;
        };
        if entry.status != EntryStatus::InProgress {
            return false;
        }
        entry.status = EntryStatus::Done;
        entry.completed_at = Some(Utc::now());
        if pr.is_some() {
            entry.pr = pr;
        }
        true
    }

    /// `in_progress → failed`.
    pub fn mark_failed(&mut self, task: &TaskId, error: &str) -> bool {
        let Some(entry) = self.entry_mut(task) else {
            return false;
        };
        if entry.status != EntryStatus::InProgress {
            return false;
        }
        entry.status = EntryStatus::Failed;
        entry.error = Some(error.to_string());
        entry.failed_at = Some(Utc::now());
        true
    }

    pub fn stats(&self) -> RunStats {
        let mut stats = RunStats {
            total: self.tasks.len(),
            ..Default::default()
        };
        for entry in &self.tasks {
            match entry.status {
                EntryStatus::Pending => stats.pending += 1,
                EntryStatus::InProgress => stats.in_progress += 1,
                EntryStatus::Done => stats.done += 1,
                EntryStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|e| e.status == EntryStatus::Done)
    }

    /// The entry to work on next: failed entries first (retry), then pending,
    /// then any left in progress by an interrupted run. `None` only when
    /// every entry is done.
    pub fn next_task(&self) -> Option<&TaskEntry> {
        self.next_task_within(None)
    }

    /// Like [`next_task`](Self::next_task), but failed entries that already
    /// used `max_attempts` attempts are skipped.
    pub fn next_task_within(&self, max_attempts: Option<u32>) -> Option<&TaskEntry> {
        let lowest = |status: EntryStatus| {
            self.tasks
                .iter()
                .filter(|e| e.status == status)
                .filter(|e| {
                    status != EntryStatus::Failed || max_attempts.map_or(true, |max| e.attempts < max)
                })
                .min_by_key(|e| e.order)
        };
        lowest(EntryStatus::Failed)
            .or_else(|| lowest(EntryStatus::Pending))
            .or_else(|| lowest(EntryStatus::InProgress))
    }

    /// Failed entries that have used up their attempts.
    pub fn exhausted(&self, max_attempts: Option<u32>) -> Vec<&TaskEntry> {
        let Some(max) = max_attempts else {
            return Vec::new();
        };
        self.tasks
            .iter()
            .filter(|e| e.status == EntryStatus::Failed && e.attempts >= max)
            .collect()
    }

    /// Entries left `in_progress` by a run that did not finish become
    /// `failed` so they are retried first. The interrupted attempt is given
    /// back: stopping a run is not a task defect. Returns how many were reset.
    pub fn recover_interrupted(&mut self) -> usize {
        let mut count = 0;
        for entry in self.tasks.iter_mut() {
            if entry.status == EntryStatus::InProgress {
                entry.status = EntryStatus::Failed;
                entry.attempts = entry.attempts.saturating_sub(1);
                entry.error = Some("interrupted".to_string());
                entry.failed_at = Some(Utc::now());
                count += 1;
            }
        }
        count
    }

    pub fn done_refs(&self) -> HashSet<TaskId> {
        self.tasks
            .iter()
            .filter(|e| e.status == EntryStatus::Done)
            .map(|e| e.task.clone())
            .collect()
    }
}

/// File persistence for `RunState` at `<root>/.locus/run-state.json`.
#[derive(Debug, Clone)]
pub struct RunStateStore {
    path: PathBuf,
}

impl RunStateStore {
    pub fn new(locus_dir: &Path) -> Self {
        Self {
            path: locus_dir.join(RUN_STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<RunState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        let state: RunState = serde_json::from_str(&contents)?;
        debug!(path = %self.path.display(), run = %state.run_id, "run state loaded");
        Ok(Some(state))
    }

    /// Write through a temp file and rename so a crash never leaves a
    /// truncated state file.
    pub fn save(&self, state: &RunState) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let contents = serde_json::to_string_pretty(state)?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, contents)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
