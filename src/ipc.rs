//! Worker → pool messages.
//!
//! Workers print one JSON object per line on stdout. Anything on stdout that
//! does not parse as a message is ordinary output and gets relayed to the log.

use std::io::Write;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::task::TaskId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    Heartbeat,
    Stats {
        tasks_completed: u32,
        tasks_failed: u32,
    },
    TaskStarted {
        task_id: TaskId,
    },
    TaskCompleted {
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pr: Option<String>,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
}

impl WorkerMessage {
    /// Parse one stdout line; `None` for anything that is not a message.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }

    pub fn to_line(&self) -> String {
        // Serializing a plain enum of strings and integers cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"heartbeat"}"#.to_string())
    }
}

/// Writes messages to the parent. Cheap to clone; clones share the writer.
#[derive(Clone)]
pub struct Reporter {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Reporter {
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
        }
    }

    /// Send one message. A closed pipe means the parent is gone; the error
    /// is ignored and the worker will be reaped.
    pub fn send(&self, message: &WorkerMessage) {
        let line = message.to_line();
        trace!(message = %line, "ipc send");
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }

    pub fn heartbeat(&self) {
        self.send(&WorkerMessage::Heartbeat);
    }
}
