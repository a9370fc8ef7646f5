//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Building a `Context` around one
//! - Shell snippets that speak the worker IPC protocol

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;

use locus::clock::{Clock, SystemClock};
use locus::config::Config;
use locus::Context;

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// Keeps the directory alive for the test's duration.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new repository on branch `main` with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        git(&path, &["init", "-q"]);
        git(&path, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&path, &["config", "user.email", "test@test.com"]);
        git(&path, &["config", "user.name", "Test User"]);
        git(&path, &["config", "commit.gpgsign", "false"]);

        std::fs::write(path.join("README.md"), "# Test Repository\n").expect("Failed to write README");
        std::fs::write(path.join(".gitignore"), ".locus/\n").expect("Failed to write .gitignore");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-q", "-m", "Initial commit"]);

        Self { temp_dir, path }
    }

    /// Create a branch with one extra commit on it, then return to `main`.
    pub fn create_branch_with_commit(&self, branch: &str, filename: &str) {
        git(&self.path, &["checkout", "-q", "-b", branch]);
        std::fs::write(self.path.join(filename), "on a branch\n").expect("Failed to write file");
        git(&self.path, &["add", filename]);
        git(&self.path, &["commit", "-q", "-m", "branch commit"]);
        git(&self.path, &["checkout", "-q", "main"]);
    }

    pub fn rev_parse(&self, rev: &str) -> Option<String> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", rev])
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git rev-parse");
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.rev_parse(&format!("refs/heads/{}", branch)).is_some()
    }

    /// A context rooted at this repository.
    pub fn context(&self, config: Config) -> Context {
        self.context_with_clock(config, Arc::new(SystemClock))
    }

    pub fn context_with_clock(&self, config: Config, clock: Arc<dyn Clock>) -> Context {
        Context::new(self.path.clone(), config, clock)
    }
}

/// Run git in `cwd`, panicking on failure.
pub fn git(cwd: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Config tuned for fast tests: short grace period and heartbeat tick.
pub fn fast_config(worker_command: &str) -> Config {
    let mut config = Config::default();
    config.agents.worker_command = Some(worker_command.to_string());
    config.agents.heartbeat_tick_secs = 1;
    config.agents.stop_grace_secs = 1;
    config.git.push = false;
    config
}

/// Shell loop over the worker's `--task <id>` arguments. `body` runs once per
/// task with the id in `$2`.
pub fn for_each_task(body: &str) -> String {
    format!(
        r#"while [ $# -gt 0 ]; do
  if [ "$1" = "--task" ]; then
    {body}
    shift
  fi
  shift
done"#
    )
}

pub fn started(var: &str) -> String {
    format!(r#"echo "{{\"type\":\"task_started\",\"taskId\":\"{var}\"}}""#)
}

pub fn completed(var: &str) -> String {
    format!(r#"echo "{{\"type\":\"task_completed\",\"taskId\":\"{var}\",\"pr\":\"https://example.com/o/r/pull/{var}\"}}""#)
}

pub fn failed(var: &str) -> String {
    format!(r#"echo "{{\"type\":\"task_failed\",\"taskId\":\"{var}\",\"error\":\"tests failed\"}}""#)
}

/// Lines of a file the workers append to, or empty when it was never written.
pub fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|s| s.lines().map(String::from).collect())
        .unwrap_or_default()
}
