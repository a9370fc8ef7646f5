//! Git access.
//!
//! Mutating operations (worktrees, branches, push, checkout) go through the
//! `git` CLI behind the [`GitRunner`] trait so they behave exactly like the
//! user's own git. Repository discovery uses `git2`.

use std::path::{Path, PathBuf};
use std::process::Command;

use git2::Repository;
use tracing::debug;

use crate::{Error, Result};

/// Captured result of one git invocation.
#[derive(Debug, Clone, Default)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs git commands in a working directory.
pub trait GitRunner: Send + Sync {
    fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput>;

    /// Run and turn a non-zero exit into `Error::GitCommand`.
    fn run_checked(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let output = self.run(cwd, args)?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(Error::GitCommand {
                command: args.join(" "),
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// The system `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    binary: PathBuf,
}

impl GitCli {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("git"),
        }
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitRunner for GitCli {
    fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput> {
        debug!(cwd = %cwd.display(), args = ?args, "git");
        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(cwd)
            .output()?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PorcelainWorktree {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
}

/// Parse `git worktree list --porcelain` output.
///
/// Entries are separated by blank lines; `branch` lines carry the full ref
/// name, which is shortened to the branch name here.
pub fn parse_worktree_porcelain(output: &str) -> Vec<PorcelainWorktree> {
    let mut entries = Vec::new();
    let mut current: Option<PorcelainWorktree> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(PorcelainWorktree {
                path: PathBuf::from(path),
                branch: None,
                head: None,
            });
        } else if let Some(entry) = current.as_mut() {
            if let Some(head) = line.strip_prefix("HEAD ") {
                entry.head = Some(head.to_string());
            } else if let Some(branch) = line.strip_prefix("branch ") {
                let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
                entry.branch = Some(short.to_string());
            }
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

/// Top-level working directory of the repository containing `path`.
pub fn discover_root(path: &Path) -> Result<PathBuf> {
    let repo = Repository::discover(path)?;
    repo.workdir()
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::Validation(format!("{} is a bare repository", path.display())))
}
