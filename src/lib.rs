pub mod clock;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod git;
pub mod ipc;
pub mod log;
pub mod orchestrator;
pub mod pool;
pub mod run_state;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod worker;
pub mod worktree;

pub use context::Context;
pub use dispatch::{AgentIdentity, ClaimFilter, Dispatcher, TaskOutcome};
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, RunMode, RunOutcome};
pub use pool::{AgentPool, PoolConfig, PoolEvent};
pub use run_state::{RunState, RunStateStore};
pub use task::{AgentId, Task, TaskId, TaskStatus};
