//! Tests for the task and bundle model

use crate::task::{operator_exports, Task, TaskOutcome};
use uuid::Uuid;

#[test]
fn test_new_task_is_schedulable() {
    let task = Task::new("echo 1", Uuid::new_v4(), "host-a");
    assert!(task.is_schedulable());
    assert!(!task.is_complete());
    assert!(!task.is_failed());
    assert_eq!(task.attempt, 1);
    assert_eq!(task.previous_id, None);
}

#[test]
fn test_completion_predicates() {
    let mut task = Task::new("false", Uuid::new_v4(), "host-a");
    task.exit_status = Some(1);
    assert!(task.is_complete());
    assert!(task.is_failed());

    task.exit_status = Some(0);
    assert!(task.is_complete());
    assert!(!task.is_failed());
}

#[test]
fn test_retry_lineage() {
    let mut original = Task::new("false", Uuid::new_v4(), "host-a");
    original.tags.insert("group".to_string(), "nightly".to_string());
    original.exit_status = Some(1);

    let retry = original.retry();
    assert_ne!(retry.id, original.id);
    assert_eq!(retry.previous_id, Some(original.id));
    assert_eq!(retry.attempt, original.attempt + 1);
    assert_eq!(retry.args, original.args);
    assert!(retry.is_schedulable());
    assert!(!retry.is_complete());
    // Tags are inherited by the retry row.
    assert_eq!(retry.tags.get("group").map(String::as_str), Some("nightly"));
}

#[test]
fn test_environ_projection() {
    let mut task = Task::new("echo 1", Uuid::new_v4(), "host-a");
    task.attempt = 2;
    task.start_time = Some(100);

    let environ = task.environ("/work");
    let lookup = |name: &str| {
        environ
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    };

    assert_eq!(lookup("TASK_ID"), Some(task.id.to_string()));
    assert_eq!(lookup("TASK_ARGS"), Some("echo 1".to_string()));
    assert_eq!(lookup("TASK_ATTEMPT"), Some("2".to_string()));
    assert_eq!(lookup("TASK_CWD"), Some("/work".to_string()));
    assert_eq!(lookup("TASK_START_TIME"), Some("100".to_string()));
    // Unset fields are exported as empty strings.
    assert_eq!(lookup("TASK_CLIENT_ID"), Some(String::new()));
    assert_eq!(lookup("TASK_PREVIOUS_ID"), Some(String::new()));
}

#[test]
fn test_operator_exports() {
    std::env::set_var("HYPERSHELL_EXPORT_CUDA_DEVICE", "3");
    let exports = operator_exports();
    std::env::remove_var("HYPERSHELL_EXPORT_CUDA_DEVICE");

    assert!(exports
        .iter()
        .any(|(key, value)| key == "CUDA_DEVICE" && value == "3"));
}

#[test]
fn test_outcome_requires_completion_fields() {
    let mut task = Task::new("true", Uuid::new_v4(), "host-a");
    assert!(TaskOutcome::from_task(&task).is_none());

    task.exit_status = Some(0);
    task.client_id = Some(Uuid::new_v4());
    task.client_host = Some("worker".to_string());
    task.start_time = Some(10);
    task.completion_time = Some(11);

    let outcome = TaskOutcome::from_task(&task).unwrap();
    assert_eq!(outcome.task_id, task.id);
    assert_eq!(outcome.exit_status, 0);
    assert_eq!(outcome.start_time, 10);
}

#[test]
fn test_task_serialization_round_trip() {
    let mut task = Task::new("echo round-trip", Uuid::new_v4(), "host-a");
    task.tags.insert("key".to_string(), String::new());

    let json = serde_json::to_string(&task).unwrap();
    let back: Task = serde_json::from_str(&json).unwrap();
    assert_eq!(back, task);
}
