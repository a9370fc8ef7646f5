//! Git worktree lifecycle for task checkouts.
//!
//! Each task gets one isolated checkout at `<root>/<worktree_dir>/issue-<ref>`
//! on branch `<prefix>/issue-<ref>`. Creation is idempotent, removal is
//! best-effort, and directories that exist on disk but are no longer
//! registered with git are reported as stale.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::git::{parse_worktree_porcelain, GitRunner};
use crate::{Error, Result};

pub const DEFAULT_WORKTREE_DIR: &str = ".locus/worktrees";
pub const DEFAULT_BRANCH_PREFIX: &str = "locus";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorktreeStatus {
    Active,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeInfo {
    pub task_ref: String,
    pub path: PathBuf,
    pub branch: String,
    pub status: WorktreeStatus,
}

pub struct WorktreeManager {
    git: Arc<dyn GitRunner>,
    worktree_dir: PathBuf,
    branch_prefix: String,
}

/// Reduce a task reference to characters safe in paths and branch names.
///
/// References that needed rewriting get a short digest of the original
/// appended, so `a/b` and `a-b` never share a checkout.
pub fn sanitize_ref(task_ref: &str) -> String {
    let safe: String = task_ref
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if safe == task_ref {
        return safe;
    }
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, task_ref.as_bytes()).simple().to_string();
    format!("{}-{}", safe, &digest[..8])
}

/// Canonicalize for comparison, falling back to the path as given when it
/// does not exist.
fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl WorktreeManager {
    pub fn new(git: Arc<dyn GitRunner>, worktree_dir: impl Into<PathBuf>, branch_prefix: &str) -> Self {
        Self {
            git,
            worktree_dir: worktree_dir.into(),
            branch_prefix: branch_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn worktree_root(&self, root: &Path) -> PathBuf {
        root.join(&self.worktree_dir)
    }

    pub fn worktree_path(&self, root: &Path, task_ref: &str) -> PathBuf {
        self.worktree_root(root)
            .join(format!("issue-{}", sanitize_ref(task_ref)))
    }

    pub fn branch_name(&self, task_ref: &str) -> String {
        format!("{}/issue-{}", self.branch_prefix, sanitize_ref(task_ref))
    }

    /// Create the checkout for `task_ref`, or return the existing one.
    ///
    /// A leftover branch of the same name from an earlier run is deleted
    /// first so `worktree add -b` starts cleanly from `base_branch`.
    pub fn create(&self, root: &Path, task_ref: &str, base_branch: &str) -> Result<WorktreeInfo> {
        if task_ref.trim().is_empty() {
            return Err(Error::Validation("empty task reference".to_string()));
        }
        let path = self.worktree_path(root, task_ref);
        let branch = self.branch_name(task_ref);

        if path.exists() {
            debug!(path = %path.display(), "worktree already exists");
            let status = if self.registered_paths(root)?.contains(&canonical(&path)) {
                WorktreeStatus::Active
            } else {
                WorktreeStatus::Stale
            };
            return Ok(WorktreeInfo {
                task_ref: task_ref.to_string(),
                path,
                branch,
                status,
            });
        }

        std::fs::create_dir_all(self.worktree_root(root))?;

        // Leftover branch from a previous attempt; absence is fine
        let _ = self.git.run(root, &["branch", "-D", &branch]);

        let path_str = path.to_string_lossy().into_owned();
        self.git
            .run_checked(root, &["worktree", "add", &path_str, "-b", &branch, base_branch])
            .map_err(|e| Error::WorktreeCreate {
                task_ref: task_ref.to_string(),
                reason: e.to_string(),
            })?;

        info!(task = task_ref, branch = %branch, "worktree created");
        Ok(WorktreeInfo {
            task_ref: task_ref.to_string(),
            path,
            branch,
            status: WorktreeStatus::Active,
        })
    }

    /// Like [`create`](Self::create), but a stale directory in the way is
    /// deleted and replaced by a registered checkout. Running in an
    /// unregistered directory would commit into the root repository.
    pub fn create_fresh(&self, root: &Path, task_ref: &str, base_branch: &str) -> Result<WorktreeInfo> {
        let info = self.create(root, task_ref, base_branch)?;
        if info.status == WorktreeStatus::Active {
            return Ok(info);
        }
        warn!(path = %info.path.display(), "replacing stale worktree directory");
        std::fs::remove_dir_all(&info.path)?;
        let info = self.create(root, task_ref, base_branch)?;
        if info.status != WorktreeStatus::Active {
            return Err(Error::WorktreeCreate {
                task_ref: task_ref.to_string(),
                reason: "stale directory could not be replaced".to_string(),
            });
        }
        Ok(info)
    }

    /// Remove the checkout and branch for `task_ref`. Failures are logged,
    /// never returned.
    pub fn remove(&self, root: &Path, task_ref: &str) {
        let path = self.worktree_path(root, task_ref);
        let branch = self.branch_name(task_ref);
        self.remove_path(root, &path);
        if let Err(e) = self.git.run_checked(root, &["branch", "-D", &branch]) {
            debug!(branch = %branch, error = %e, "branch delete skipped");
        }
    }

    fn remove_path(&self, root: &Path, path: &Path) {
        let path_str = path.to_string_lossy().into_owned();

        if self
            .git
            .run_checked(root, &["worktree", "remove", &path_str])
            .is_ok()
        {
            return;
        }
        if self
            .git
            .run_checked(root, &["worktree", "remove", "--force", &path_str])
            .is_ok()
        {
            return;
        }

        if path.exists() {
            if let Err(e) = std::fs::remove_dir_all(path) {
                warn!(path = %path.display(), error = %e, "failed to remove worktree directory");
            }
        }
        if let Err(e) = self.git.run_checked(root, &["worktree", "prune"]) {
            warn!(error = %e, "worktree prune failed");
        }
    }

    /// Canonical paths git currently knows as worktrees. A failed listing is
    /// an error: an empty registry would make every checkout look stale.
    fn registered_paths(&self, root: &Path) -> Result<HashSet<PathBuf>> {
        let out = self
            .git
            .run_checked(root, &["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_porcelain(&out)
            .into_iter()
            .map(|w| canonical(&w.path))
            .collect())
    }

    /// Every `issue-*` directory under the worktree root, reconciled against
    /// git's own list.
    pub fn list(&self, root: &Path) -> Result<Vec<WorktreeInfo>> {
        let dir = self.worktree_root(root);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let out = self
            .git
            .run_checked(root, &["worktree", "list", "--porcelain"])?;
        let registered = parse_worktree_porcelain(&out);

        let mut infos = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(task_ref) = name.strip_prefix("issue-") else {
                continue;
            };
            let path = entry.path();
            let canon = canonical(&path);
            let known = registered.iter().find(|w| canonical(&w.path) == canon);
            infos.push(WorktreeInfo {
                task_ref: task_ref.to_string(),
                branch: known
                    .and_then(|w| w.branch.clone())
                    .unwrap_or_else(|| self.branch_name(task_ref)),
                status: if known.is_some() {
                    WorktreeStatus::Active
                } else {
                    WorktreeStatus::Stale
                },
                path,
            });
        }
        infos.sort_by(|a, b| a.task_ref.cmp(&b.task_ref));
        Ok(infos)
    }

    /// Delete stale checkouts and prune git's bookkeeping. Returns how many
    /// directories were removed.
    pub fn cleanup_stale(&self, root: &Path) -> Result<usize> {
        let mut removed = 0;
        for info in self.list(root)? {
            if info.status != WorktreeStatus::Stale {
                continue;
            }
            match std::fs::remove_dir_all(&info.path) {
                Ok(()) => {
                    debug!(path = %info.path.display(), "removed stale worktree");
                    removed += 1;
                }
                Err(e) => warn!(path = %info.path.display(), error = %e, "failed to remove stale worktree"),
            }
        }
        if let Err(e) = self.git.run_checked(root, &["worktree", "prune"]) {
            warn!(error = %e, "worktree prune failed");
        }
        if removed > 0 {
            info!(removed, "cleaned stale worktrees");
        }
        Ok(removed)
    }
}
