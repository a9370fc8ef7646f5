//! Per-invocation context: repository root, configuration and clock.
//!
//! Built once in `main` and passed down explicitly; components take what they
//! need from it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::git::{discover_root, GitCli};
use crate::run_state::RunStateStore;
use crate::store::{HttpTaskStore, TaskStore};
use crate::worktree::WorktreeManager;
use crate::Result;

#[derive(Clone)]
pub struct Context {
    pub root: PathBuf,
    pub config: Config,
    pub clock: Arc<dyn Clock>,
}

impl Context {
    pub fn new(root: PathBuf, config: Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            root,
            config,
            clock,
        }
    }

    /// Resolve the repository containing `start` and load its config.
    pub fn load(start: &Path) -> Result<Self> {
        let root = discover_root(start)?;
        let config = Config::load(&root)?;
        Ok(Self::new(root, config, Arc::new(SystemClock)))
    }

    pub fn locus_dir(&self) -> PathBuf {
        Config::locus_dir(&self.root)
    }

    pub fn log_path(&self) -> PathBuf {
        Config::log_path(&self.root)
    }

    /// HTTP store for the configured workspace.
    pub fn task_store(&self) -> Result<Arc<dyn TaskStore>> {
        self.config.require_api()?;
        Ok(Arc::new(HttpTaskStore::new(
            &self.config.api.url,
            &self.config.api.workspace_id,
            self.config.api.api_key.clone(),
        )))
    }

    pub fn dispatcher(&self, store: Arc<dyn TaskStore>) -> Dispatcher {
        Dispatcher::new(store, self.clock.clone()).with_lock_ttl(self.config.lock_ttl())
    }

    pub fn worktrees(&self) -> WorktreeManager {
        WorktreeManager::new(
            Arc::new(GitCli::new()),
            self.config.worktree_dir(),
            &self.config.git.branch_prefix,
        )
    }

    pub fn run_state_store(&self) -> RunStateStore {
        RunStateStore::new(&self.locus_dir())
    }

    /// Branch shared by all tasks of a sprint run.
    pub fn sprint_branch(&self, sprint_id: &str) -> String {
        format!(
            "{}/sprint-{}",
            self.config.git.branch_prefix.trim_end_matches('/'),
            crate::worktree::sanitize_ref(sprint_id)
        )
    }
}
