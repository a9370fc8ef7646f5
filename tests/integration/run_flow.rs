//! Sprint and parallel runs driven end to end with shell-script workers.
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use locus::clock::ManualClock;
use locus::config::Config;
use locus::orchestrator::{launcher_for, Orchestrator, RunMode, RunOutcome};
use locus::run_state::{EntryStatus, RunKind, RunState};
use locus::store::{MemoryTaskStore, TaskStore};
use locus::{Context, Task, TaskId, TaskStatus};

use super::fixtures::{completed, failed, fast_config, for_each_task, read_lines, started, TestRepo};

fn orchestrator(ctx: Context, store: Arc<MemoryTaskStore>) -> Orchestrator {
    let launcher = launcher_for(&ctx, Vec::new()).unwrap();
    let store: Arc<dyn TaskStore> = store;
    Orchestrator::new(ctx, store, launcher)
}

/// Worker script that logs its arguments and completes every task it is given.
fn completing_worker(log: &std::path::Path) -> String {
    let body = format!(
        "echo \"$2\" >> {log}\n    {}\n    {}",
        started("$2"),
        completed("$2"),
        log = log.display()
    );
    format!("echo \"args: $*\" >> {}.args\n{}", log.display(), for_each_task(&body))
}

fn ids(tasks: &[&str]) -> Vec<TaskId> {
    tasks.iter().map(|t| TaskId::from(*t)).collect()
}

/// Test: Tiers run in order
/// Given A (tier 0), B depending on A, and C (tier 0)
/// When a parallel run executes with one agent
/// Then B only starts after A and C are done, and the run state is cleared
#[tokio::test]
async fn test_parallel_run_respects_tiers() {
    let repo = TestRepo::new();
    let log = repo.path.join(".locus/ran.log");
    std::fs::create_dir_all(repo.path.join(".locus")).unwrap();
    let ctx = repo.context(fast_config(&completing_worker(&log)));
    let store = Arc::new(MemoryTaskStore::new(vec![
        Task::new("A", "schema"),
        Task::new("B", "api").depending_on(&["A"]),
        Task::new("C", "docs"),
    ]));
    let mut orchestrator = orchestrator(ctx, store);

    let mode = RunMode::Parallel {
        sprint_id: None,
        task_ids: Vec::new(),
    };
    let outcome = orchestrator.run(&mode, &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(read_lines(&log), vec!["A", "C", "B"]);
    let rounds = read_lines(&log.with_extension("log.args"));
    assert_eq!(rounds.len(), 2);
    assert!(orchestrator.run_states().load().unwrap().is_none());
}

/// Test: Sprint run uses the shared branch, one task per worker
#[tokio::test]
async fn test_sprint_run_is_sequential_on_sprint_branch() {
    let repo = TestRepo::new();
    let log = repo.path.join(".locus/ran.log");
    std::fs::create_dir_all(repo.path.join(".locus")).unwrap();
    let ctx = repo.context(fast_config(&completing_worker(&log)));
    let mut review = Task::new("0", "already reviewed").with_sprint("s1");
    review.status = TaskStatus::InReview;
    let store = Arc::new(MemoryTaskStore::new(vec![
        review,
        Task::new("1", "first").with_sprint("s1"),
        Task::new("2", "second").with_sprint("s1"),
        Task::new("9", "other sprint").with_sprint("s2"),
    ]));
    let mut orchestrator = orchestrator(ctx, store);

    let mode = RunMode::Sprint {
        sprint_id: "s1".to_string(),
    };
    let outcome = orchestrator.run(&mode, &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(read_lines(&log), vec!["1", "2"]);
    let args = read_lines(&log.with_extension("log.args"));
    assert_eq!(
        args,
        vec![
            "args: --sprint s1 --branch locus/sprint-s1 --task 1",
            "args: --sprint s1 --branch locus/sprint-s1 --task 2",
        ]
    );
}

/// Test: A model override reaches every worker
#[tokio::test]
async fn test_model_override_is_passed_to_workers() {
    let repo = TestRepo::new();
    let log = repo.path.join(".locus/ran.log");
    std::fs::create_dir_all(repo.path.join(".locus")).unwrap();
    let mut config = fast_config(&completing_worker(&log));
    config.executor.model = Some("opus".to_string());
    let ctx = repo.context(config);
    let store = Arc::new(MemoryTaskStore::new(vec![Task::new("1", "only")]));
    let mut orchestrator = orchestrator(ctx, store);

    let mode = RunMode::Parallel {
        sprint_id: None,
        task_ids: Vec::new(),
    };
    let outcome = orchestrator.run(&mode, &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(read_lines(&log), vec!["1"]);
    assert_eq!(
        read_lines(&log.with_extension("log.args")),
        vec!["args: --model opus --task 1"]
    );
}

/// Test: A worker that dies mid-task fails the task, bounded by the attempt cap
/// Given a worker that starts its task and exits 1 without reporting
/// When the run uses at most two attempts per task
/// Then the run fails after two attempts and keeps its state
#[tokio::test]
async fn test_crashing_worker_exhausts_attempts() {
    let repo = TestRepo::new();
    let script = format!("{}\nexit 1", for_each_task(&started("$2")));
    let mut config = fast_config(&script);
    config.dispatch.max_task_attempts = Some(2);
    let ctx = repo.context(config);
    let store = Arc::new(MemoryTaskStore::new(vec![Task::new("1", "flaky")]));
    let mut orchestrator = orchestrator(ctx, store);

    let mode = RunMode::Parallel {
        sprint_id: None,
        task_ids: ids(&["1"]),
    };
    let outcome = orchestrator.run(&mode, &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, RunOutcome::Failed);
    let state = orchestrator.run_states().load().unwrap().unwrap();
    let entry = state.entry(&TaskId::from("1")).unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(entry.attempts, 2);
    assert_eq!(entry.error.as_deref(), Some("worker exited with code 1"));
}

/// Test: Reported failures are retried before pending work
#[tokio::test]
async fn test_sprint_retries_failed_task_first() {
    let repo = TestRepo::new();
    let log = repo.path.join(".locus/ran.log");
    std::fs::create_dir_all(repo.path.join(".locus")).unwrap();
    // Task 1 fails on its first attempt only
    let marker = repo.path.join(".locus/failed-once");
    let body = format!(
        r#"echo "$2" >> {log}
    {start}
    if [ "$2" = "1" ] && [ ! -f {marker} ]; then
      touch {marker}
      {fail}
    else
      {done}
    fi"#,
        log = log.display(),
        marker = marker.display(),
        start = started("$2"),
        fail = failed("$2"),
        done = completed("$2"),
    );
    let ctx = repo.context(fast_config(&for_each_task(&body)));
    let store = Arc::new(MemoryTaskStore::new(vec![
        Task::new("1", "first").with_sprint("s1"),
        Task::new("2", "second").with_sprint("s1"),
    ]));
    let mut orchestrator = orchestrator(ctx, store);

    let mode = RunMode::Sprint {
        sprint_id: "s1".to_string(),
    };
    let outcome = orchestrator.run(&mode, &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(read_lines(&log), vec!["1", "1", "2"]);
}

/// Test: A saved run is resumed
/// Given a saved sprint run with task 1 done and task 2 left in progress
/// When the sprint is run again
/// Then only task 2 is executed
#[tokio::test]
async fn test_sprint_resumes_saved_run() {
    let repo = TestRepo::new();
    let log = repo.path.join(".locus/ran.log");
    let ctx = repo.context(fast_config(&completing_worker(&log)));

    let mut saved = RunState::new(
        RunKind::Sprint,
        Some(ctx.sprint_branch("s1")),
        &ids(&["1", "2"]),
    );
    saved.mark_in_progress(&TaskId::from("1"));
    saved.mark_done(&TaskId::from("1"), None);
    saved.mark_in_progress(&TaskId::from("2"));
    ctx.run_state_store().save(&saved).unwrap();

    let mut done = Task::new("1", "first").with_sprint("s1");
    done.status = TaskStatus::InReview;
    let store = Arc::new(MemoryTaskStore::new(vec![
        done,
        Task::new("2", "second").with_sprint("s1"),
    ]));
    let mut orchestrator = orchestrator(ctx, store);

    let mode = RunMode::Sprint {
        sprint_id: "s1".to_string(),
    };
    let outcome = orchestrator.run(&mode, &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(read_lines(&log), vec!["2"]);
}

/// Test: Cancellation interrupts the run without failing it
#[tokio::test]
async fn test_cancelled_run_is_interrupted() {
    let repo = TestRepo::new();
    let body = format!("{}\n    sleep 30", started("$2"));
    let ctx = repo.context(fast_config(&for_each_task(&body)));
    let store = Arc::new(MemoryTaskStore::new(vec![Task::new("1", "slow")]));
    let mut orchestrator = orchestrator(ctx, store);

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            token.cancel();
        });
    }
    let mode = RunMode::Parallel {
        sprint_id: None,
        task_ids: Vec::new(),
    };
    let outcome = tokio::time::timeout(Duration::from_secs(10), orchestrator.run(&mode, &token))
        .await
        .expect("run did not stop after cancellation")
        .unwrap();

    assert_eq!(outcome, RunOutcome::Interrupted);
    assert_eq!(outcome.exit_code(), 130);
    let state = orchestrator.run_states().load().unwrap().unwrap();
    assert_eq!(
        state.entry(&TaskId::from("1")).unwrap().status,
        EntryStatus::InProgress
    );
}

/// Test: A silent worker is killed and its task failed
/// Given a worker that starts a task and then goes quiet
/// When eleven minutes pass on the clock with a ten minute threshold
/// Then the agent is killed and the task recorded as failed
#[tokio::test]
async fn test_stale_worker_is_killed() {
    let repo = TestRepo::new();
    let body = format!("{}\n    sleep 30", started("$2"));
    let mut config: Config = fast_config(&for_each_task(&body));
    config.dispatch.max_task_attempts = Some(1);
    let clock = Arc::new(ManualClock::default());
    let ctx = repo.context_with_clock(config, clock.clone());
    let store = Arc::new(MemoryTaskStore::new(vec![Task::new("1", "hangs")]));
    let mut orchestrator = orchestrator(ctx, store);

    {
        let clock = clock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            clock.advance(chrono::Duration::minutes(11));
        });
    }
    let mode = RunMode::Parallel {
        sprint_id: None,
        task_ids: Vec::new(),
    };
    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        orchestrator.run(&mode, &CancellationToken::new()),
    )
    .await
    .expect("stale worker was never killed")
    .unwrap();

    assert_eq!(outcome, RunOutcome::Failed);
    let state = orchestrator.run_states().load().unwrap().unwrap();
    let entry = state.entry(&TaskId::from("1")).unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert!(entry.error.as_deref().unwrap().contains("unresponsive"));
}

#[tokio::test]
async fn test_empty_backlog_completes() {
    let repo = TestRepo::new();
    let ctx = repo.context(fast_config("exit 0"));
    let store = Arc::new(MemoryTaskStore::new(Vec::new()));
    let mut orchestrator = orchestrator(ctx, store);
    let mode = RunMode::Sprint {
        sprint_id: "empty".to_string(),
    };
    let outcome = orchestrator.run(&mode, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
}
