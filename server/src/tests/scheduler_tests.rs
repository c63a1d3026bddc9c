//! Tests for the database-backed scheduler

use crate::database::TaskStore;
use crate::scheduler::Scheduler;
use shared::config::ServerConfig;
use shared::task::{Bundle, Task, TaskOutcome};
use shared::utils::current_timestamp;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

struct Harness {
    store: Arc<Mutex<TaskStore>>,
    queue_rx: mpsc::Receiver<Bundle>,
    drain_rx: watch::Receiver<bool>,
    scheduler: tokio::task::JoinHandle<anyhow::Result<()>>,
    _dir: TempDir,
}

fn test_config(bundlesize: usize, attempts: u32) -> ServerConfig {
    ServerConfig {
        bundlesize,
        attempts,
        queuesize: 8,
        wait: 1,
        ..ServerConfig::default()
    }
}

/// Start a scheduler over a store pre-loaded with the given tasks; the
/// submitter is reported as already finished.
async fn start(tasks: Vec<Task>, config: ServerConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut store = TaskStore::open(&dir.path().join("task.db")).unwrap();
    store.initialize().unwrap();
    store.insert(&tasks).unwrap();
    let store = Arc::new(Mutex::new(store));

    let (queue_tx, queue_rx) = mpsc::channel::<Bundle>(config.queuesize);
    let (drain_tx, drain_rx) = watch::channel(false);
    // The submitter is reported as already finished.
    let (_done_tx, done_rx) = watch::channel(true);
    let (shutdown_tx, _) = broadcast::channel(1);

    let scheduler = Scheduler::new(
        config,
        Arc::clone(&store),
        queue_tx,
        Uuid::new_v4(),
        done_rx,
        drain_tx,
        drain_rx.clone(),
        false,
        shutdown_tx.subscribe(),
    );
    let handle = tokio::spawn(scheduler.run());

    Harness {
        store,
        queue_rx,
        drain_rx,
        scheduler: handle,
        _dir: dir,
    }
}

fn successful(task: &Task) -> TaskOutcome {
    completed(task, 0)
}

fn completed(task: &Task, exit_status: i64) -> TaskOutcome {
    let now = current_timestamp();
    TaskOutcome {
        task_id: task.id,
        exit_status,
        client_id: Uuid::new_v4(),
        client_host: "worker".to_string(),
        start_time: now,
        completion_time: now + 1,
        outpath: None,
        errpath: None,
    }
}

#[tokio::test]
async fn test_schedules_bundles_and_drains_when_done() {
    let submit_id = Uuid::new_v4();
    let tasks: Vec<Task> = (0..3)
        .map(|i| {
            let mut task = Task::new(format!("echo {}", i), submit_id, "host");
            task.submit_time = i;
            task
        })
        .collect();
    let mut harness = start(tasks, test_config(2, 1)).await;

    let first = timeout(Duration::from_secs(10), harness.queue_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = timeout(Duration::from_secs(10), harness.queue_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 1);

    // Simulate clients returning everything.
    {
        let mut store = harness.store.lock().await;
        for task in first.iter().chain(second.iter()) {
            store.complete(&successful(task)).unwrap();
        }
    }

    timeout(Duration::from_secs(10), harness.drain_rx.wait_for(|d| *d))
        .await
        .expect("scheduler should drain")
        .unwrap();
    timeout(Duration::from_secs(5), harness.scheduler)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_failed_tasks_are_retried_up_to_attempts() {
    let task = Task::new("false", Uuid::new_v4(), "host");
    let mut harness = start(vec![task.clone()], test_config(1, 2)).await;

    // First attempt fails.
    let bundle = timeout(Duration::from_secs(10), harness.queue_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bundle[0].id, task.id);
    {
        let mut store = harness.store.lock().await;
        store.complete(&completed(&bundle[0], 1)).unwrap();
    }

    // The retry row arrives with lineage intact.
    let bundle = timeout(Duration::from_secs(10), harness.queue_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let retry = &bundle[0];
    assert_eq!(retry.previous_id, Some(task.id));
    assert_eq!(retry.attempt, 2);
    assert_eq!(retry.args, "false");

    // Second failure exhausts the attempts and the workload drains.
    {
        let mut store = harness.store.lock().await;
        store.complete(&completed(retry, 1)).unwrap();
    }
    timeout(Duration::from_secs(10), harness.drain_rx.wait_for(|d| *d))
        .await
        .expect("scheduler should drain after attempts exhausted")
        .unwrap();

    let mut store = harness.store.lock().await;
    assert_eq!(store.totals().unwrap().0, 2);
    assert_eq!(store.count_finally_failed().unwrap(), 1);
}

#[tokio::test]
async fn test_closed_queue_stops_the_loop() {
    // More work than the queue can hold, so the scheduler is still
    // publishing when the consumer goes away.
    let tasks: Vec<Task> = (0..32)
        .map(|i| Task::new(format!("echo {}", i), Uuid::new_v4(), "host"))
        .collect();
    let harness = start(tasks, test_config(1, 1)).await;

    drop(harness.queue_rx);
    timeout(Duration::from_secs(10), harness.scheduler)
        .await
        .expect("scheduler should stop when the queue closes")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_restart_reverts_abandoned_tasks() {
    let dir = TempDir::new().unwrap();
    let mut store = TaskStore::open(&dir.path().join("task.db")).unwrap();
    store.initialize().unwrap();
    let tasks: Vec<Task> = (0..2)
        .map(|i| Task::new(format!("echo {}", i), Uuid::new_v4(), "host"))
        .collect();
    store.insert(&tasks).unwrap();
    // A previous run claimed everything and then died.
    store.claim_next(2, false, Uuid::new_v4(), "old-server").unwrap();
    assert_eq!(store.count_schedulable().unwrap(), 0);
    let store = Arc::new(Mutex::new(store));

    let (queue_tx, _queue_rx) = mpsc::channel::<Bundle>(8);
    let (drain_tx, drain_rx) = watch::channel(false);
    let (_done_tx, done_rx) = watch::channel(false);
    let (shutdown_tx, _) = broadcast::channel(1);
    let scheduler = Scheduler::new(
        test_config(1, 1),
        Arc::clone(&store),
        queue_tx,
        Uuid::new_v4(),
        done_rx,
        drain_tx,
        drain_rx,
        false,
        shutdown_tx.subscribe(),
    );

    assert_eq!(scheduler.revert_abandoned().await.unwrap(), 2);
    assert_eq!(store.lock().await.count_schedulable().unwrap(), 2);
}
