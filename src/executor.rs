//! Task execution through an AI coding CLI.
//!
//! The worker hands a claimed task and its checkout to a `TaskExecutor`.
//! `AgentCliExecutor` runs the configured CLI headless (`-p <prompt>`) in the
//! checkout and reports whether it succeeded, plus any pull-request URL it
//! printed.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info};

use crate::task::Task;
use crate::{Error, Result};

/// Default timeout for one task execution (1 hour, matching the lock TTL).
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Longest summary kept from the CLI output.
const SUMMARY_LIMIT: usize = 2000;

static PR_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://[^\s/]+/[\w.-]+/[\w.-]+/(?:pull|pulls|merge_requests)/\d+").unwrap()
});

/// Result of one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub summary: String,
    pub pr: Option<String>,
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run `task` inside `checkout`. A task that ran but did not succeed is
    /// `Ok` with `success == false`; `Err` is reserved for not being able to
    /// run at all (spawn failure, timeout).
    async fn execute(&self, task: &Task, checkout: &Path) -> Result<ExecutionResult>;
}

/// The last pull/merge request URL printed in `text`.
pub fn extract_pr_url(text: &str) -> Option<String> {
    PR_URL_RE
        .find_iter(text)
        .last()
        .map(|m| m.as_str().to_string())
}

/// The prompt handed to the CLI for `task`.
pub fn build_prompt(task: &Task) -> String {
    let mut prompt = format!("Task {}: {}\n", task.id, task.title);
    if !task.description.trim().is_empty() {
        prompt.push('\n');
        prompt.push_str(task.description.trim());
        prompt.push('\n');
    }
    prompt.push_str("\nWork in the current directory. Commit your changes when done.\n");
    prompt
}

fn summarize(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.len() <= SUMMARY_LIMIT {
        return trimmed.to_string();
    }
    // Keep the tail; the conclusion is at the end
    let mut start = trimmed.len() - SUMMARY_LIMIT;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[derive(Debug, Clone)]
pub struct AgentCliExecutor {
    base_command: Vec<String>,
    model: Option<String>,
    timeout: Duration,
}

impl AgentCliExecutor {
    /// `command` may carry leading arguments, e.g. `"claude --verbose"`.
    pub fn new(command: &str) -> Self {
        let mut base_command: Vec<String> = command.split_whitespace().map(String::from).collect();
        if base_command.is_empty() {
            base_command.push("claude".to_string());
        }
        Self {
            base_command,
            model: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|m| !m.is_empty());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &str {
        &self.base_command[0]
    }

    /// Resolve the binary, failing early when it is not installed.
    pub fn resolve(&self) -> Result<PathBuf> {
        which::which(self.binary()).map_err(|_| Error::AgentNotAvailable(self.binary().to_string()))
    }

    /// Full argument vector (excluding the binary) for `prompt`.
    pub fn args(&self, prompt: &str) -> Vec<String> {
        let mut args: Vec<String> = self.base_command[1..].to_vec();
        args.push("-p".to_string());
        args.push(prompt.to_string());
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args
    }
}

#[async_trait]
impl TaskExecutor for AgentCliExecutor {
    async fn execute(&self, task: &Task, checkout: &Path) -> Result<ExecutionResult> {
        let binary = self.resolve()?;
        let prompt = build_prompt(task);
        debug!(binary = %binary.display(), cwd = %checkout.display(), "running agent CLI");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&binary)
                .args(self.args(&prompt))
                .current_dir(checkout)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))?
        .map_err(Error::Io)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let summary = if stderr.trim().is_empty() {
                format!(
                    "agent CLI exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                summarize(&stderr)
            };
            return Ok(ExecutionResult {
                success: false,
                summary,
                pr: None,
            });
        }

        let pr = extract_pr_url(&stdout);
        info!(task = %task.id, pr = ?pr, "agent CLI finished");
        Ok(ExecutionResult {
            success: true,
            summary: summarize(&stdout),
            pr,
        })
    }
}
