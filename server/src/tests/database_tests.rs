//! Tests for the task store

use crate::database::{CompleteResult, TaskStore};
use shared::task::{Task, TaskOutcome, EXIT_STATUS_CANCELLED};
use shared::utils::current_timestamp;
use tempfile::TempDir;
use uuid::Uuid;

fn open_store(dir: &TempDir) -> TaskStore {
    let mut store = TaskStore::open(&dir.path().join("task.db")).unwrap();
    store.initialize().unwrap();
    store
}

fn submitted(args: &str, submit_time: i64) -> Task {
    let mut task = Task::new(args, Uuid::new_v4(), "submit-host");
    task.submit_time = submit_time;
    task
}

fn outcome(task: &Task, exit_status: i64) -> TaskOutcome {
    let start = current_timestamp();
    TaskOutcome {
        task_id: task.id,
        exit_status,
        client_id: Uuid::new_v4(),
        client_host: "worker".to_string(),
        start_time: start,
        completion_time: start + 1,
        outpath: None,
        errpath: None,
    }
}

#[test]
fn test_insert_and_get_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let mut task = submitted("echo 1", 100);
    task.tags.insert("group".to_string(), "nightly".to_string());
    task.tags.insert("empty".to_string(), String::new());
    store.insert(std::slice::from_ref(&task)).unwrap();

    let loaded = store.get_task(task.id).unwrap().unwrap();
    assert_eq!(loaded, task);
    assert!(store.get_task(Uuid::new_v4()).unwrap().is_none());
}

#[test]
fn test_claim_follows_submission_order() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let tasks = vec![
        submitted("third", 300),
        submitted("first", 100),
        submitted("second", 200),
    ];
    store.insert(&tasks).unwrap();

    let server_id = Uuid::new_v4();
    let claimed = store.claim_next(2, false, server_id, "server-host").unwrap();
    let args: Vec<&str> = claimed.iter().map(|t| t.args.as_str()).collect();
    assert_eq!(args, vec!["first", "second"]);

    for task in &claimed {
        assert!(task.schedule_time.is_some());
        assert_eq!(task.server_id, Some(server_id));
        assert_eq!(task.server_host.as_deref(), Some("server-host"));
    }
    assert_eq!(store.count_schedulable().unwrap(), 1);
}

#[test]
fn test_claim_never_returns_a_row_twice() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let tasks: Vec<Task> = (0..10)
        .map(|i| submitted(&format!("task {}", i), 100 + i))
        .collect();
    store.insert(&tasks).unwrap();

    let server = Uuid::new_v4();
    let first = store.claim_next(6, false, server, "host").unwrap();
    let second = store.claim_next(6, false, server, "host").unwrap();

    assert_eq!(first.len(), 6);
    assert_eq!(second.len(), 4);
    let mut all: Vec<Uuid> = first.iter().chain(&second).map(|t| t.id).collect();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 10);
    assert!(store.claim_next(6, false, server, "host").unwrap().is_empty());
}

#[test]
fn test_parallel_claimers_never_share_a_row() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("task.db");
    {
        let mut store = TaskStore::open(&path).unwrap();
        store.initialize().unwrap();
        let tasks: Vec<Task> = (0..50)
            .map(|i| submitted(&format!("task {}", i), 100 + i))
            .collect();
        store.insert(&tasks).unwrap();
    }

    // Two claimers on independent connections, racing over the same rows.
    let claimers: Vec<_> = (0..2)
        .map(|_| {
            let path = path.clone();
            std::thread::spawn(move || {
                let mut store = TaskStore::open(&path).unwrap();
                let server = Uuid::new_v4();
                let mut mine = Vec::new();
                loop {
                    let claimed = store.claim_next(5, false, server, "host").unwrap();
                    if claimed.is_empty() {
                        break;
                    }
                    mine.extend(claimed.into_iter().map(|t| t.id));
                }
                mine
            })
        })
        .collect();

    let mut all: Vec<Uuid> = claimers
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    assert_eq!(all.len(), 50);
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 50, "a task row was claimed twice");
}

#[test]
fn test_eager_claim_prefers_retries() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let novel = submitted("novel", 100);
    let mut retry = submitted("again", 900);
    retry.previous_id = Some(Uuid::new_v4());
    retry.attempt = 2;
    store.insert(&[novel.clone(), retry.clone()]).unwrap();

    let claimed = store.claim_next(1, true, Uuid::new_v4(), "host").unwrap();
    assert_eq!(claimed[0].id, retry.id);

    // Without eager, plain submission order wins.
    store.revert_incomplete().unwrap();
    let claimed = store.claim_next(1, false, Uuid::new_v4(), "host").unwrap();
    assert_eq!(claimed[0].id, novel.id);
}

#[test]
fn test_complete_records_derived_timings() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let base = current_timestamp();
    let task = submitted("echo", base);
    store.insert(std::slice::from_ref(&task)).unwrap();
    store.claim_next(1, false, Uuid::new_v4(), "host").unwrap();

    let record = TaskOutcome {
        task_id: task.id,
        exit_status: 0,
        client_id: Uuid::new_v4(),
        client_host: "worker".to_string(),
        start_time: base + 50,
        completion_time: base + 70,
        outpath: Some("/tmp/a.out".to_string()),
        errpath: None,
    };
    assert_eq!(store.complete(&record).unwrap(), CompleteResult::Applied);

    let loaded = store.get_task(task.id).unwrap().unwrap();
    assert_eq!(loaded.exit_status, Some(0));
    assert_eq!(loaded.waited, Some(50));
    assert_eq!(loaded.duration, Some(20));
    assert_eq!(loaded.outpath.as_deref(), Some("/tmp/a.out"));
    assert!(loaded.schedule_time.unwrap() <= loaded.completion_time.unwrap());
}

#[test]
fn test_complete_is_idempotent_and_first_write_wins() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let task = submitted("flaky", 100);
    store.insert(std::slice::from_ref(&task)).unwrap();

    let record = outcome(&task, 1);
    assert_eq!(store.complete(&record).unwrap(), CompleteResult::Applied);
    // Identical replay is a no-op.
    assert_eq!(store.complete(&record).unwrap(), CompleteResult::Duplicate);

    // Conflicting outcome is discarded.
    let mut conflicting = record.clone();
    conflicting.exit_status = 0;
    assert_eq!(store.complete(&conflicting).unwrap(), CompleteResult::Anomaly);
    let loaded = store.get_task(task.id).unwrap().unwrap();
    assert_eq!(loaded.exit_status, Some(1));

    // Completion for an unknown task is discarded too.
    let unknown = outcome(&submitted("ghost", 1), 0);
    assert_eq!(store.complete(&unknown).unwrap(), CompleteResult::Anomaly);
}

#[test]
fn test_revert_restores_schedulable_state() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let tasks = vec![submitted("a", 1), submitted("b", 2), submitted("c", 3)];
    store.insert(&tasks).unwrap();
    let claimed = store.claim_next(3, false, Uuid::new_v4(), "host").unwrap();
    store.complete(&outcome(&claimed[0], 0)).unwrap();

    // Restart-style revert touches the incomplete rows only.
    let reverted = store.revert_incomplete().unwrap();
    assert_eq!(reverted, 2);
    assert_eq!(store.count_schedulable().unwrap(), 2);
    let completed = store.get_task(claimed[0].id).unwrap().unwrap();
    assert!(completed.is_complete());
    assert!(completed.schedule_time.is_some());
}

#[test]
fn test_revert_ids_skips_completed_rows() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let tasks = vec![submitted("a", 1), submitted("b", 2)];
    store.insert(&tasks).unwrap();
    let claimed = store.claim_next(2, false, Uuid::new_v4(), "host").unwrap();
    store.complete(&outcome(&claimed[0], 0)).unwrap();

    let ids: Vec<Uuid> = claimed.iter().map(|t| t.id).collect();
    let reverted = store.revert_ids(&ids).unwrap();
    assert_eq!(reverted, 1);
    assert!(store.get_task(claimed[1].id).unwrap().unwrap().is_schedulable());
}

#[test]
fn test_retry_candidates_lineage() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let task = submitted("false", 100);
    store.insert(std::slice::from_ref(&task)).unwrap();
    store.claim_next(1, false, Uuid::new_v4(), "host").unwrap();
    store.complete(&outcome(&task, 1)).unwrap();

    let candidates = store.retry_candidates(3, 10).unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].id, task.id);

    // Inserting the retry row removes the original from the candidate set.
    let retry = candidates[0].retry();
    assert_eq!(retry.attempt, 2);
    assert_eq!(retry.previous_id, Some(task.id));
    store.insert(std::slice::from_ref(&retry)).unwrap();
    assert!(store.retry_candidates(3, 10).unwrap().is_empty());

    // A failed retry becomes the next candidate, until the ceiling.
    store.claim_next(1, false, Uuid::new_v4(), "host").unwrap();
    store.complete(&outcome(&retry, 1)).unwrap();
    let candidates = store.retry_candidates(3, 10).unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].id, retry.id);
    assert!(store.retry_candidates(2, 10).unwrap().is_empty());
}

#[test]
fn test_cancelled_tasks_are_not_retried_or_claimed() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let task = submitted("doomed", 100);
    store.insert(std::slice::from_ref(&task)).unwrap();
    assert_eq!(store.cancel(task.id).unwrap(), 1);

    let loaded = store.get_task(task.id).unwrap().unwrap();
    assert_eq!(loaded.exit_status, Some(EXIT_STATUS_CANCELLED));
    assert!(!loaded.is_schedulable());
    assert!(store.claim_next(10, false, Uuid::new_v4(), "host").unwrap().is_empty());
    assert!(store.retry_candidates(5, 10).unwrap().is_empty());

    // Cancelling a completed task is a no-op.
    assert_eq!(store.cancel(task.id).unwrap(), 0);
}

#[test]
fn test_template_errors_are_not_retried() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let mut task = submitted("echo {[9]}", 100);
    let now = current_timestamp();
    task.schedule_time = Some(now);
    task.completion_time = Some(now);
    task.exit_status = Some(shared::task::EXIT_STATUS_TEMPLATE_ERROR);
    store.insert(std::slice::from_ref(&task)).unwrap();

    // Complete-and-failed, but never claimed and never retried.
    assert!(store.claim_next(10, false, Uuid::new_v4(), "host").unwrap().is_empty());
    assert!(store.retry_candidates(5, 10).unwrap().is_empty());
    assert_eq!(store.count_finally_failed().unwrap(), 1);
}

#[test]
fn test_counts_and_totals() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let tasks = vec![submitted("a", 1), submitted("b", 2), submitted("c", 3)];
    store.insert(&tasks).unwrap();
    store.claim_next(3, false, Uuid::new_v4(), "host").unwrap();
    store.complete(&outcome(&tasks[0], 0)).unwrap();
    store.complete(&outcome(&tasks[1], 2)).unwrap();

    assert_eq!(store.count_remaining().unwrap(), 1);
    assert_eq!(store.totals().unwrap(), (3, 2, 1));
    assert_eq!(store.count_finally_failed().unwrap(), 1);

    // A pending retry row clears the finally-failed count.
    let retry = store.get_task(tasks[1].id).unwrap().unwrap().retry();
    store.insert(std::slice::from_ref(&retry)).unwrap();
    assert_eq!(store.count_finally_failed().unwrap(), 0);
}

#[test]
fn test_recent_avg_duration_window() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    assert_eq!(store.recent_avg_duration(600).unwrap(), None);

    let tasks = vec![submitted("a", 1), submitted("b", 2)];
    store.insert(&tasks).unwrap();
    let now = current_timestamp();
    for (task, duration) in tasks.iter().zip([10_i64, 20_i64]) {
        let record = TaskOutcome {
            task_id: task.id,
            exit_status: 0,
            client_id: Uuid::new_v4(),
            client_host: "worker".to_string(),
            start_time: now - duration,
            completion_time: now,
            outpath: None,
            errpath: None,
        };
        store.complete(&record).unwrap();
    }

    let avg = store.recent_avg_duration(600).unwrap().unwrap();
    assert!((avg - 15.0).abs() < 1e-9);
}

#[test]
fn test_update_field_allowlist() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let task = submitted("a", 1);
    store.insert(std::slice::from_ref(&task)).unwrap();
    assert_eq!(store.update_field(task.id, "args", "b").unwrap(), 1);
    assert_eq!(store.get_task(task.id).unwrap().unwrap().args, "b");
    assert!(store.update_field(task.id, "exit_status", "0").is_err());
}

#[test]
fn test_delete_removes_row_and_tags() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let mut task = submitted("a", 1);
    task.tags.insert("key".to_string(), "value".to_string());
    store.insert(std::slice::from_ref(&task)).unwrap();
    assert_eq!(store.delete(task.id).unwrap(), 1);
    assert!(store.get_task(task.id).unwrap().is_none());
    assert_eq!(store.delete(task.id).unwrap(), 0);
}

#[test]
fn test_query_with_predicate() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);

    let tasks = vec![submitted("a", 1), submitted("b", 2)];
    store.insert(&tasks).unwrap();
    store.claim_next(1, false, Uuid::new_v4(), "host").unwrap();

    let schedulable = store
        .query(Some("schedule_time IS NULL"), None, 100)
        .unwrap();
    assert_eq!(schedulable.len(), 1);
    assert_eq!(schedulable[0].args, "b");
    assert_eq!(store.query(None, None, 100).unwrap().len(), 2);

    let newest_first = store.query(None, Some("submit_time DESC"), 1).unwrap();
    assert_eq!(newest_first[0].args, "b");
}
