//! Claiming under contention and full worker loops.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use locus::clock::{Clock, ManualClock};
use locus::executor::{ExecutionResult, TaskExecutor};
use locus::git::GitCli;
use locus::ipc::Reporter;
use locus::store::MemoryTaskStore;
use locus::worker::{Worker, WorkerOptions};
use locus::worktree::WorktreeManager;
use locus::{AgentId, AgentIdentity, ClaimFilter, Dispatcher, Task, TaskOutcome, TaskStatus};

use super::fixtures::TestRepo;

/// Records which agent ran which task, and checks it ran inside a checkout.
#[derive(Default)]
struct RecordingExecutor {
    runs: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl TaskExecutor for RecordingExecutor {
    async fn execute(&self, task: &Task, checkout: &Path) -> locus::Result<ExecutionResult> {
        assert!(checkout.join("README.md").exists(), "not a checkout: {}", checkout.display());
        let branch = checkout
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.runs.lock().unwrap().push((task.id.to_string(), branch));
        Ok(ExecutionResult {
            success: true,
            summary: format!("did {}", task.title),
            pr: None,
        })
    }
}

fn worker(
    repo: &TestRepo,
    store: Arc<MemoryTaskStore>,
    executor: Arc<RecordingExecutor>,
    name: &str,
) -> Worker {
    let git = Arc::new(GitCli::new());
    let mut options = WorkerOptions::new(AgentIdentity::new(AgentId::from(name)), ClaimFilter::default());
    options.push = false;
    Worker::new(
        repo.path.clone(),
        Dispatcher::new(store, Arc::new(locus::clock::SystemClock)),
        WorktreeManager::new(git.clone(), ".locus/worktrees", "locus"),
        git,
        executor,
        Reporter::new(Box::new(std::io::sink())),
        options,
    )
}

/// Test: Workers drain a shared backlog
/// Given six backlog tasks and three workers on one store
/// When the workers run concurrently
/// Then every task runs exactly once, in its own worktree, and ends in review
#[tokio::test]
async fn test_workers_share_backlog_without_overlap() {
    let repo = TestRepo::new();
    let tasks: Vec<Task> = (1..=6).map(|i| Task::new(i.to_string(), &format!("task {}", i))).collect();
    let store = Arc::new(MemoryTaskStore::new(tasks));
    let executor = Arc::new(RecordingExecutor::default());

    let a = worker(&repo, store.clone(), executor.clone(), "agent-a");
    let b = worker(&repo, store.clone(), executor.clone(), "agent-b");
    let c = worker(&repo, store.clone(), executor.clone(), "agent-c");
    let token = CancellationToken::new();
    let (ra, rb, rc) = tokio::join!(a.run(&token), b.run(&token), c.run(&token));

    let total: u32 = [ra, rb, rc].into_iter().map(|r| r.unwrap().completed).sum();
    assert_eq!(total, 6);

    let runs = executor.runs.lock().unwrap().clone();
    let mut per_task: HashMap<String, usize> = HashMap::new();
    for (task, checkout) in &runs {
        *per_task.entry(task.clone()).or_default() += 1;
        assert_eq!(checkout, &format!("issue-{}", task));
    }
    assert_eq!(per_task.len(), 6);
    assert!(per_task.values().all(|&n| n == 1));

    for i in 1..=6 {
        let task = store.snapshot(&i.to_string()).unwrap();
        assert_eq!(task.status, TaskStatus::InReview);
        assert!(task.locked_by.is_none());
        assert!(!repo.branch_exists(&format!("locus/issue-{}", i)));
    }
    assert_eq!(store.comments().len(), 6);
    assert!(!repo.path.join(".locus/worktrees/issue-1").exists());
}

/// Test: Expired lock is taken over
/// Given agent A holds a claim
/// When the TTL passes and agent B claims
/// Then B gets the task and A can no longer finish it
#[tokio::test]
async fn test_expired_lock_is_taken_over() {
    let store = Arc::new(MemoryTaskStore::new(vec![Task::new("1", "only task")]));
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let dispatcher = Dispatcher::new(store.clone(), clock.clone()).with_lock_ttl(Duration::from_secs(3600));
    let a = AgentIdentity::new(AgentId::from("agent-a"));
    let b = AgentIdentity::new(AgentId::from("agent-b"));

    let claimed = dispatcher.claim(&a, &ClaimFilter::default()).await.unwrap();
    assert!(claimed.is_some());
    assert!(dispatcher.claim(&b, &ClaimFilter::default()).await.unwrap().is_none());

    clock.advance(chrono::Duration::minutes(61));
    let taken = dispatcher.claim(&b, &ClaimFilter::default()).await.unwrap().unwrap();
    assert_eq!(taken.locked_by, Some(b.id.clone()));

    let outcome = TaskOutcome::Completed {
        pr: None,
        summary: String::new(),
    };
    assert!(!dispatcher.finish(&taken.id, &a.id, &outcome).await.unwrap());
    assert!(dispatcher.finish(&taken.id, &b.id, &outcome).await.unwrap());
    assert_eq!(store.snapshot("1").unwrap().status, TaskStatus::InReview);
}

#[tokio::test]
async fn test_renewal_keeps_claim_past_original_ttl() {
    let store = Arc::new(MemoryTaskStore::new(vec![Task::new("1", "long task")]));
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let dispatcher = Dispatcher::new(store.clone(), clock.clone()).with_lock_ttl(Duration::from_secs(3600));
    let a = AgentIdentity::new(AgentId::from("agent-a"));
    let b = AgentIdentity::new(AgentId::from("agent-b"));

    let task = dispatcher.claim(&a, &ClaimFilter::default()).await.unwrap().unwrap();
    clock.advance(chrono::Duration::minutes(50));
    assert!(dispatcher.renew(&task.id, &a.id).await.unwrap());
    clock.advance(chrono::Duration::minutes(50));

    assert!(dispatcher.claim(&b, &ClaimFilter::default()).await.unwrap().is_none());
    let held = store.snapshot("1").unwrap();
    assert!(held.is_locked_by(&a.id, clock.now()));
}
