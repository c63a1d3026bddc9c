//! Task and bundle model for the HyperShell execution engine
//!
//! A `Task` is one shell command line submitted for execution, identified by
//! a UUID. Tasks travel between server and client grouped into bundles and
//! are persisted as rows in the task store. A retried task is a new row that
//! points at its predecessor through `previous_id`; completed rows are never
//! modified again.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::utils::current_timestamp;

/// Exit status recorded for a cancelled task.
pub const EXIT_STATUS_CANCELLED: i64 = -1;

/// Exit status recorded when the escalation ladder failed to stop the process.
pub const EXIT_STATUS_TIMEOUT: i64 = -2;

/// Exit status recorded when template expansion failed for the task.
pub const EXIT_STATUS_TEMPLATE_ERROR: i64 = -3;

/// One shell command line submitted for execution.
///
/// The `args` field holds the original line as submitted; `command` holds the
/// expanded line after template application (set at submit time or schedule
/// time depending on mode, or by the executor just before launch).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Globally unique, immutable identifier
    pub id: Uuid,
    /// The original command line as submitted
    pub args: String,
    /// The expanded command line after template application
    pub command: Option<String>,

    /// Identifier of the submitting process
    pub submit_id: Uuid,
    /// Host the task was submitted from
    pub submit_host: String,
    /// Unix time of submission
    pub submit_time: i64,

    /// Identifier of the scheduling server, set on claim
    pub server_id: Option<Uuid>,
    /// Host of the scheduling server, set on claim
    pub server_host: Option<String>,
    /// Unix time of the claim; NULL means schedulable
    pub schedule_time: Option<i64>,

    /// Identifier of the executing client
    pub client_id: Option<Uuid>,
    /// Host of the executing client
    pub client_host: Option<String>,
    /// Unix time execution started
    pub start_time: Option<i64>,
    /// Unix time execution finished
    pub completion_time: Option<i64>,

    /// Process exit status; NULL means not yet completed
    pub exit_status: Option<i64>,

    /// 1-based attempt counter
    pub attempt: i64,
    /// Task id this attempt supersedes
    pub previous_id: Option<Uuid>,

    /// Seconds between submission and start of execution
    pub waited: Option<i64>,
    /// Seconds between start and completion of execution
    pub duration: Option<i64>,

    /// Path of the captured stdout stream, if any
    pub outpath: Option<String>,
    /// Path of the captured stderr stream, if any
    pub errpath: Option<String>,

    /// User-defined key/value tags (value may be empty)
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl Task {
    /// Create a new schedulable task from a submitted command line.
    pub fn new(args: impl Into<String>, submit_id: Uuid, submit_host: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            args: args.into(),
            command: None,
            submit_id,
            submit_host: submit_host.into(),
            submit_time: current_timestamp(),
            server_id: None,
            server_host: None,
            schedule_time: None,
            client_id: None,
            client_host: None,
            start_time: None,
            completion_time: None,
            exit_status: None,
            attempt: 1,
            previous_id: None,
            waited: None,
            duration: None,
            outpath: None,
            errpath: None,
            tags: HashMap::new(),
        }
    }

    /// Create the retry row for a failed task.
    ///
    /// The retry is a fresh schedulable row with its own id, `previous_id`
    /// pointing at this task and the attempt counter advanced. Tags are
    /// inherited; the original row is left untouched.
    pub fn retry(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            args: self.args.clone(),
            command: None,
            submit_id: self.submit_id,
            submit_host: self.submit_host.clone(),
            submit_time: current_timestamp(),
            server_id: None,
            server_host: None,
            schedule_time: None,
            client_id: None,
            client_host: None,
            start_time: None,
            completion_time: None,
            exit_status: None,
            attempt: self.attempt + 1,
            previous_id: Some(self.id),
            waited: None,
            duration: None,
            outpath: None,
            errpath: None,
            tags: self.tags.clone(),
        }
    }

    /// A task is schedulable until a scheduler claims it.
    pub fn is_schedulable(&self) -> bool {
        self.schedule_time.is_none()
    }

    /// A task is complete once an exit status is recorded.
    pub fn is_complete(&self) -> bool {
        self.exit_status.is_some()
    }

    /// A task failed if it completed with a non-zero exit status.
    pub fn is_failed(&self) -> bool {
        matches!(self.exit_status, Some(status) if status != 0)
    }

    /// Environment variables projected onto the spawned shell process.
    ///
    /// Everything the task knows about itself is exposed under `TASK_*`;
    /// unknown fields are exported as empty strings so scripts can test for
    /// presence without tripping `set -u`.
    pub fn environ(&self, cwd: &str) -> Vec<(String, String)> {
        fn opt<T: ToString>(value: &Option<T>) -> String {
            value.as_ref().map(|v| v.to_string()).unwrap_or_default()
        }

        vec![
            ("TASK_ID".to_string(), self.id.to_string()),
            ("TASK_ARGS".to_string(), self.args.clone()),
            ("TASK_COMMAND".to_string(), opt(&self.command)),
            ("TASK_SUBMIT_ID".to_string(), self.submit_id.to_string()),
            ("TASK_SUBMIT_HOST".to_string(), self.submit_host.clone()),
            ("TASK_SUBMIT_TIME".to_string(), self.submit_time.to_string()),
            ("TASK_SERVER_ID".to_string(), opt(&self.server_id)),
            ("TASK_SERVER_HOST".to_string(), opt(&self.server_host)),
            ("TASK_SCHEDULE_TIME".to_string(), opt(&self.schedule_time)),
            ("TASK_CLIENT_ID".to_string(), opt(&self.client_id)),
            ("TASK_CLIENT_HOST".to_string(), opt(&self.client_host)),
            ("TASK_ATTEMPT".to_string(), self.attempt.to_string()),
            ("TASK_PREVIOUS_ID".to_string(), opt(&self.previous_id)),
            ("TASK_CWD".to_string(), cwd.to_string()),
            ("TASK_START_TIME".to_string(), opt(&self.start_time)),
            ("TASK_WAITED".to_string(), opt(&self.waited)),
            ("TASK_OUTPATH".to_string(), opt(&self.outpath)),
            ("TASK_ERRPATH".to_string(), opt(&self.errpath)),
        ]
    }
}

/// Operator-configured exports: any process environment variable named
/// `HYPERSHELL_EXPORT_<NAME>` is injected into every task as `<NAME>`.
pub fn operator_exports() -> Vec<(String, String)> {
    std::env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix("HYPERSHELL_EXPORT_")
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_string(), value))
        })
        .collect()
}

/// An ordered group of tasks transported as a unit between server and client.
pub type Bundle = Vec<Task>;

/// Completion record for one task, produced by an executor and applied to the
/// task store by the receiver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub exit_status: i64,
    pub client_id: Uuid,
    pub client_host: String,
    pub start_time: i64,
    pub completion_time: i64,
    pub outpath: Option<String>,
    pub errpath: Option<String>,
}

impl TaskOutcome {
    /// Build the outcome record from a finished task.
    ///
    /// The executor fills the execution fields on its copy of the task; this
    /// collects them into the compact record the wire and the store consume.
    pub fn from_task(task: &Task) -> Option<Self> {
        Some(Self {
            task_id: task.id,
            exit_status: task.exit_status?,
            client_id: task.client_id?,
            client_host: task.client_host.clone()?,
            start_time: task.start_time?,
            completion_time: task.completion_time?,
            outpath: task.outpath.clone(),
            errpath: task.errpath.clone(),
        })
    }
}
