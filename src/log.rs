//! Structured logging for locus.
//!
//! Log levels:
//! - ERROR: Failures that end a run or a worker
//! - WARN: Recoverable conditions (cleanup failures, lost lock races, stale agents)
//! - INFO: Run lifecycle (spawn, task start/finish, tier changes)
//! - DEBUG: Detailed operation traces (git commands, store calls)
//! - TRACE: Raw IPC traffic
//!
//! Debug mode can be enabled with `--debug` flag or `LOCUS_DEBUG=1` env var.
//! `LOCUS_LOG` takes a full `EnvFilter` directive and wins over both.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "LOCUS_LOG";
pub const DEBUG_ENV: &str = "LOCUS_DEBUG";

/// Check if debug mode was requested through the environment.
pub fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

/// Default filter directive for the given debug setting.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "locus=debug,info"
    } else {
        "info"
    }
}

fn build_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug || env_debug())))
}

/// Initialize logging to stderr, optionally duplicating into `log_file`.
///
/// Worker processes log to stderr only; their stdout carries IPC messages.
/// Calling this more than once is harmless (later calls are ignored).
pub fn init(debug: bool, log_file: Option<&Path>) {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let file_layer = log_file.and_then(open_log_file).map(|file| {
        fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_target(true)
    });

    let _ = tracing_subscriber::registry()
        .with(build_filter(debug))
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
}

fn open_log_file(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok()?;
    }
    // Truncate on startup, one log per orchestrator invocation
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .ok()
}
