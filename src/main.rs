use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use locus::dispatch::{AgentIdentity, ClaimFilter};
use locus::executor::AgentCliExecutor;
use locus::git::GitCli;
use locus::ipc::Reporter;
use locus::orchestrator::{launcher_for, Orchestrator, RunMode};
use locus::run_state::EntryStatus;
use locus::worker::{self, Worker, WorkerOptions};
use locus::{AgentId, Context, Result, TaskId};

/// Locus - dispatches backlog tasks to a pool of AI coding agents
#[derive(Parser, Debug)]
#[command(name = "locus")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    LOCUS_DEBUG=1      Enable debug logging (alternative to --debug)\n    LOCUS_LOG=<filter> Full tracing filter directive\n    LOCUS_API_KEY      Task store API key")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Repository to operate on (defaults to the current directory)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run tasks with a pool of agents
    Run {
        #[command(subcommand)]
        mode: RunCommand,
    },

    /// Worker process entry point (spawned by the pool)
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Show the saved run state
    Status,

    /// Inspect or clean task worktrees
    Worktrees {
        #[command(subcommand)]
        action: WorktreeCommand,
    },

    /// Discard the saved run state and remove task worktrees
    Abort,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum RunCommand {
    /// Work through a sprint's tasks one at a time on a shared branch
    Sprint {
        sprint_id: String,

        /// Override the executor model
        #[arg(long)]
        model: Option<String>,
    },

    /// Run tasks tier by tier with parallel agents
    Parallel {
        /// Only tasks of this sprint
        #[arg(long)]
        sprint: Option<String>,

        /// Explicit task ids (repeatable)
        #[arg(long = "task")]
        tasks: Vec<String>,

        /// Number of agents (capped by agents.hard_cap)
        #[arg(short = 'n', long)]
        agents: Option<usize>,

        /// Override the executor model
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum WorktreeCommand {
    /// List task worktrees
    List,
    /// Remove worktrees git no longer knows about
    Cleanup,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct WorkerArgs {
    #[arg(long)]
    pub agent_id: String,

    #[arg(long, default_value_t = 0)]
    pub index: usize,

    #[arg(long)]
    pub sprint: Option<String>,

    /// Shared branch to work on instead of per-task worktrees
    #[arg(long)]
    pub branch: Option<String>,

    #[arg(long = "task")]
    pub tasks: Vec<String>,

    /// Executor model chosen by the orchestrator
    #[arg(long)]
    pub model: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "locus failed");
            eprintln!("error: {}", e);
            1
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    let start = match &cli.root {
        Some(root) => root.clone(),
        None => std::env::current_dir()?,
    };
    let mut ctx = Context::load(&start)?;

    match cli.command {
        Command::Run { mode } => {
            locus::log::init(cli.debug, Some(&ctx.log_path()));
            let mode = match mode {
                RunCommand::Sprint { sprint_id, model } => {
                    if model.is_some() {
                        ctx.config.executor.model = model;
                    }
                    RunMode::Sprint { sprint_id }
                }
                RunCommand::Parallel {
                    sprint,
                    tasks,
                    agents,
                    model,
                } => {
                    if let Some(count) = agents {
                        ctx.config.agents.count = count;
                    }
                    if model.is_some() {
                        ctx.config.executor.model = model;
                    }
                    RunMode::Parallel {
                        sprint_id: sprint,
                        task_ids: tasks.iter().map(|t| TaskId::from(t.as_str())).collect(),
                    }
                }
            };
            run_orchestrator(ctx, mode, cli.debug)
        }
        Command::Worker(args) => {
            locus::log::init(cli.debug, None);
            run_worker(ctx, args)
        }
        Command::Status => {
            locus::log::init(cli.debug, None);
            run_status(&ctx)
        }
        Command::Worktrees { action } => {
            locus::log::init(cli.debug, None);
            run_worktrees(&ctx, action)
        }
        Command::Abort => {
            locus::log::init(cli.debug, None);
            run_abort(&ctx)
        }
    }
}

/// Arguments every spawned worker inherits.
fn global_args(ctx: &Context, debug: bool) -> Vec<String> {
    let mut args = vec!["--root".to_string(), ctx.root.display().to_string()];
    if debug {
        args.push("--debug".to_string());
    }
    args
}

fn run_orchestrator(ctx: Context, mode: RunMode, debug: bool) -> Result<i32> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let store = ctx.task_store()?;
        let launcher = launcher_for(&ctx, global_args(&ctx, debug))?;
        let mut orchestrator = Orchestrator::new(ctx, store, launcher);

        // Workers sit in their own process groups, so any stop signal must
        // reach them through the pool's shutdown
        let token = CancellationToken::new();
        spawn_stop_listener(token.clone());

        let outcome = orchestrator.run(&mode, &token).await?;
        println!("Run {:?}", outcome);
        Ok::<_, locus::Error>(outcome.exit_code())
    })
}

fn run_worker(mut ctx: Context, args: WorkerArgs) -> Result<i32> {
    if args.model.is_some() {
        ctx.config.executor.model = args.model.clone();
    }
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let store = ctx.task_store()?;
        let executor = AgentCliExecutor::new(&ctx.config.executor.command)
            .with_model(ctx.config.executor.model.clone())
            .with_timeout(ctx.config.executor_timeout());
        if let Err(e) = executor.resolve() {
            error!(agent = %args.agent_id, error = %e, "agent CLI not found");
            return Ok(worker::exit_code(&Err(e)));
        }

        let mut options = WorkerOptions::from(&ctx);
        options.agent = AgentIdentity {
            id: AgentId::from(args.agent_id.as_str()),
            roles: ctx.config.agents.roles.clone(),
        };
        options.filter = ClaimFilter {
            sprint_id: args.sprint.clone(),
            task_ids: (!args.tasks.is_empty()).then(|| {
                args.tasks
                    .iter()
                    .map(|t| TaskId::from(t.as_str()))
                    .collect::<HashSet<_>>()
            }),
            ..Default::default()
        };
        options.sprint_branch = args.branch.clone();

        let worker = Worker::new(
            ctx.root.clone(),
            ctx.dispatcher(store),
            ctx.worktrees(),
            Arc::new(GitCli::new()),
            Arc::new(executor),
            Reporter::stdout(),
            options,
        );

        let token = CancellationToken::new();
        spawn_stop_listener(token.clone());

        info!(agent = %args.agent_id, index = args.index, "worker started");
        let result = worker.run(&token).await;
        if let Err(e) = &result {
            error!(agent = %args.agent_id, error = %e, "worker stopped");
        }
        Ok::<_, locus::Error>(worker::exit_code(&result))
    })
}

/// Cancel `token` on SIGTERM or Ctrl-C. The SIGTERM handler is installed
/// before returning.
fn spawn_stop_listener(token: CancellationToken) {
    #[cfg(unix)]
    let term = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())
    };
    tokio::spawn(async move {
        #[cfg(unix)]
        match term {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("stop signal received");
        token.cancel();
    });
}

fn format_entry_status(status: EntryStatus) -> &'static str {
    match status {
        EntryStatus::Pending => "pending",
        EntryStatus::InProgress => "in progress",
        EntryStatus::Done => "done",
        EntryStatus::Failed => "failed",
    }
}

fn run_status(ctx: &Context) -> Result<i32> {
    let Some(state) = ctx.run_state_store().load()? else {
        println!("No saved run");
        return Ok(0);
    };
    let stats = state.stats();
    println!("Run:      {} ({:?})", state.run_id, state.kind);
    if let Some(branch) = &state.branch {
        println!("Branch:   {}", branch);
    }
    println!("Started:  {}", state.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!(
        "Progress: {}/{} done, {} failed, {} in progress, {} pending",
        stats.done, stats.total, stats.failed, stats.in_progress, stats.pending
    );
    println!();
    for entry in &state.tasks {
        let detail = match entry.status {
            EntryStatus::Done => entry.pr.clone().unwrap_or_default(),
            EntryStatus::Failed => entry.error.clone().unwrap_or_default(),
            _ => String::new(),
        };
        println!(
            "  {:>3}. {:<12} {:<12} attempts={} {}",
            entry.order,
            entry.task,
            format_entry_status(entry.status),
            entry.attempts,
            detail
        );
    }
    Ok(0)
}

fn run_worktrees(ctx: &Context, action: WorktreeCommand) -> Result<i32> {
    let worktrees = ctx.worktrees();
    match action {
        WorktreeCommand::List => {
            let list = worktrees.list(&ctx.root)?;
            if list.is_empty() {
                println!("No task worktrees");
            }
            for info in list {
                println!(
                    "{:<12} {:<8} {:<24} {}",
                    info.task_ref,
                    format!("{:?}", info.status).to_lowercase(),
                    info.branch,
                    info.path.display()
                );
            }
        }
        WorktreeCommand::Cleanup => {
            let removed = worktrees.cleanup_stale(&ctx.root)?;
            println!("Removed {} stale worktree(s)", removed);
        }
    }
    Ok(0)
}

fn run_abort(ctx: &Context) -> Result<i32> {
    let worktrees = ctx.worktrees();
    let list = worktrees.list(&ctx.root)?;
    for info in &list {
        worktrees.remove(&ctx.root, &info.task_ref);
    }
    ctx.run_state_store().clear()?;
    println!("Removed {} worktree(s) and the saved run state", list.len());
    Ok(0)
}
