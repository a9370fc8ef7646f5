//! Pool supervision with real worker processes.
#![cfg(unix)]

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use locus::clock::SystemClock;
use locus::pool::{AgentOutcome, AgentPool, PoolConfig, PoolEvent, ShellLauncher};
use locus::TaskId;

use super::fixtures::read_lines;

fn pool(script: &str, agents: usize) -> (AgentPool, mpsc::Receiver<PoolEvent>) {
    let (tx, rx) = mpsc::channel(100);
    let config = PoolConfig {
        agent_count: agents,
        stop_grace: Duration::from_millis(500),
        ..Default::default()
    };
    let pool = AgentPool::new(config, Arc::new(ShellLauncher::new(script)), Arc::new(SystemClock), tx);
    (pool, rx)
}

fn drain(rx: &mut mpsc::Receiver<PoolEvent>) -> Vec<PoolEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn process_alive(pid: &str) -> bool {
    Command::new("kill")
        .args(["-0", pid])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn wait_for_file(path: &Path, pool: &mut AgentPool) {
    for _ in 0..100 {
        if !read_lines(path).is_empty() {
            return;
        }
        pool.pump(Duration::from_millis(50)).await;
    }
    panic!("{} never appeared", path.display());
}

/// Test: Shutdown tears down whole process trees
/// Given two workers that each started a background child
/// When the pool shuts down
/// Then both workers and their children are gone and exits are interrupted
#[tokio::test]
async fn test_shutdown_kills_process_tree() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = format!(
        r#"sleep 300 &
echo $! > {dir}/child-$LOCUS_AGENT_INDEX.pid
echo '{{"type":"heartbeat"}}'
wait"#,
        dir = dir.path().display()
    );
    let (mut pool, mut rx) = pool(&script, 2);
    pool.spawn(0, &[]).await.unwrap();
    pool.spawn(1, &[]).await.unwrap();

    let pid_files = [dir.path().join("child-0.pid"), dir.path().join("child-1.pid")];
    for file in &pid_files {
        wait_for_file(file, &mut pool).await;
    }
    let children: Vec<String> = pid_files.iter().map(|f| read_lines(f)[0].clone()).collect();
    assert!(children.iter().all(|pid| process_alive(pid)));

    pool.shutdown().await;
    assert!(pool.is_empty());

    for pid in &children {
        let mut gone = false;
        for _ in 0..40 {
            if !process_alive(pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "background child {} survived shutdown", pid);
    }

    let interrupted = drain(&mut rx)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                PoolEvent::AgentCompleted {
                    outcome: AgentOutcome::Interrupted,
                    ..
                }
            )
        })
        .count();
    assert_eq!(interrupted, 2);
}

/// Test: Every exit is reported with its counters
/// Given three workers where the second exits non-zero mid-task
/// When waiting for the pool to drain
/// Then each exit is reported once with the right outcome and last task
#[tokio::test]
async fn test_wait_for_all_reports_every_exit() {
    let script = r#"
echo "{\"type\":\"task_started\",\"taskId\":\"t$LOCUS_AGENT_INDEX\"}"
if [ "$LOCUS_AGENT_INDEX" = "1" ]; then exit 3; fi
echo "{\"type\":\"task_completed\",\"taskId\":\"t$LOCUS_AGENT_INDEX\"}"
echo '{"type":"stats","tasksCompleted":1,"tasksFailed":0}'
"#;
    let (mut pool, mut rx) = pool(script, 3);
    for index in 0..3 {
        pool.spawn(index, &[]).await.unwrap();
    }
    pool.wait_for_all(&CancellationToken::new()).await.unwrap();
    assert!(pool.is_empty());

    let mut exits: HashMap<usize, (AgentOutcome, u32, Option<TaskId>)> = HashMap::new();
    for event in drain(&mut rx) {
        if let PoolEvent::AgentCompleted {
            index,
            outcome,
            tasks_completed,
            unfinished_task,
            ..
        } = event
        {
            assert!(exits.insert(index, (outcome, tasks_completed, unfinished_task)).is_none());
        }
    }

    assert_eq!(exits.len(), 3);
    assert_eq!(exits[&0], (AgentOutcome::Completed, 1, None));
    assert_eq!(exits[&2], (AgentOutcome::Completed, 1, None));
    assert_eq!(
        exits[&1],
        (
            AgentOutcome::Failed { exit_code: Some(3) },
            0,
            Some(TaskId::from("t1"))
        )
    );
}

#[tokio::test]
async fn test_capacity_is_capped() {
    let (mut pool, _rx) = {
        let (tx, rx) = mpsc::channel(100);
        let config = PoolConfig {
            agent_count: 10,
            hard_cap: 2,
            ..Default::default()
        };
        let pool = AgentPool::new(config, Arc::new(ShellLauncher::new("sleep 5")), Arc::new(SystemClock), tx);
        (pool, rx)
    };
    assert_eq!(pool.capacity(), 2);
    pool.spawn(0, &[]).await.unwrap();
    pool.spawn(1, &[]).await.unwrap();
    assert!(matches!(
        pool.spawn(2, &[]).await,
        Err(locus::Error::AgentPoolFull { max: 2 })
    ));
    pool.shutdown().await;
}
