//! Task store over the embedded database
//!
//! Typed CRUD for the `task` table and its `task_tag` side table. The store
//! owns a single writer connection in WAL mode; claim and completion run in
//! transactions on that connection, which serializes them and guarantees no
//! task row is handed to two claimers. A server backend with row-level
//! locking can implement the same operations behind this interface.

use anyhow::{Context, Result};
use rusqlite::{
    params, types::Type, Connection, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use shared::task::{Task, TaskOutcome, EXIT_STATUS_CANCELLED, EXIT_STATUS_TEMPLATE_ERROR};
use shared::utils::current_timestamp;
use shared::HyperShellError;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Columns of the `task` table in select order, shared by every reader.
const TASK_COLUMNS: &str = "id, args, command, submit_id, submit_host, submit_time, \
     server_id, server_host, schedule_time, client_id, client_host, start_time, \
     completion_time, exit_status, attempt, previous_id, waited, duration, outpath, errpath";

/// Result of applying a completion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteResult {
    /// The completion was recorded.
    Applied,
    /// The identical outcome was already recorded; no-op.
    Duplicate,
    /// A different outcome was already recorded; first write wins and the
    /// new record is discarded.
    Anomaly,
}

/// The task store. One writer connection, shared behind a mutex by the
/// scheduler, the receiver and the autoscaler.
pub struct TaskStore {
    conn: Connection,
}

impl TaskStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| HyperShellError::Database(format!("cannot open {}: {}", path.display(), e)))?;
        // WAL keeps readers unblocked while the single writer commits.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .context("Failed to enable WAL mode")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL")
            .context("Failed to set synchronous mode")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        Ok(Self { conn })
    }

    /// In-memory store for tests and ephemeral no-db runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Ok(Self { conn })
    }

    /// Create the schema if it does not exist.
    pub fn initialize(&mut self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS task (
                    id              TEXT PRIMARY KEY,
                    args            TEXT NOT NULL,
                    command         TEXT,
                    submit_id       TEXT NOT NULL,
                    submit_host     TEXT NOT NULL,
                    submit_time     INTEGER NOT NULL,
                    server_id       TEXT,
                    server_host     TEXT,
                    schedule_time   INTEGER,
                    client_id       TEXT,
                    client_host     TEXT,
                    start_time      INTEGER,
                    completion_time INTEGER,
                    exit_status     INTEGER,
                    attempt         INTEGER NOT NULL DEFAULT 1,
                    previous_id     TEXT,
                    waited          INTEGER,
                    duration        INTEGER,
                    outpath         TEXT,
                    errpath         TEXT
                );

                CREATE TABLE IF NOT EXISTS task_tag (
                    task_id TEXT NOT NULL,
                    key     TEXT NOT NULL,
                    value   TEXT NOT NULL DEFAULT '',
                    PRIMARY KEY (task_id, key)
                );

                CREATE INDEX IF NOT EXISTS idx_task_submit_time
                    ON task(submit_time);
                CREATE INDEX IF NOT EXISTS idx_task_exit_status
                    ON task(exit_status);
                CREATE INDEX IF NOT EXISTS idx_task_schedule
                    ON task(schedule_time, exit_status);
                "#,
            )
            .context("Failed to create task schema")?;
        info!("Task store schema ready");
        Ok(())
    }

    /// Batch-insert new tasks atomically.
    pub fn insert(&mut self, tasks: &[Task]) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin insert")?;
        for task in tasks {
            insert_in_tx(&tx, task)?;
        }
        tx.commit().context("Failed to commit insert")?;
        debug!("Inserted {} tasks", tasks.len());
        Ok(())
    }

    /// Atomically claim up to `n` schedulable tasks for this server.
    ///
    /// With `eager`, retry rows (those with a `previous_id`) come first,
    /// then submission order; otherwise submission order alone. The rows
    /// returned already carry their schedule fields.
    pub fn claim_next(
        &mut self,
        n: usize,
        eager: bool,
        server_id: Uuid,
        server_host: &str,
    ) -> Result<Vec<Task>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let now = current_timestamp();
        // An immediate transaction takes the write lock up front, so two
        // claimers on separate connections serialize instead of both reading
        // the same schedulable rows.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin claim")?;

        let order = if eager {
            "(previous_id IS NOT NULL) DESC, submit_time ASC"
        } else {
            "submit_time ASC"
        };
        let sql = format!(
            "SELECT id FROM task WHERE schedule_time IS NULL ORDER BY {} LIMIT ?1",
            order
        );
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params![n as i64], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            tx.execute(
                "UPDATE task SET schedule_time = ?1, server_id = ?2, server_host = ?3
                 WHERE id = ?4",
                params![now, server_id.to_string(), server_host, id],
            )?;
        }
        for id in &ids {
            if let Some(task) = get_in_tx(&tx, id)? {
                claimed.push(task);
            }
        }
        tx.commit().context("Failed to commit claim")?;
        Ok(claimed)
    }

    /// Record one completion. Idempotent: a replay with the identical outcome
    /// is a no-op; a conflicting outcome is discarded (first write wins).
    pub fn complete(&mut self, outcome: &TaskOutcome) -> Result<CompleteResult> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin complete")?;
        let id = outcome.task_id.to_string();

        let existing: Option<(Option<i64>, i64)> = tx
            .query_row(
                "SELECT exit_status, submit_time FROM task WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to look up task for completion")?;

        let (recorded_status, submit_time) = match existing {
            Some(row) => row,
            None => {
                warn!(task_id = %id, "Completion for unknown task discarded");
                return Ok(CompleteResult::Anomaly);
            }
        };

        if let Some(status) = recorded_status {
            let result = if status == outcome.exit_status {
                CompleteResult::Duplicate
            } else {
                warn!(
                    task_id = %id,
                    recorded = status,
                    incoming = outcome.exit_status,
                    "Conflicting completion discarded; first write wins"
                );
                CompleteResult::Anomaly
            };
            return Ok(result);
        }

        let waited = outcome.start_time - submit_time;
        let duration = outcome.completion_time - outcome.start_time;
        tx.execute(
            "UPDATE task SET exit_status = ?1, client_id = ?2, client_host = ?3,
                start_time = ?4, completion_time = ?5, waited = ?6, duration = ?7,
                outpath = ?8, errpath = ?9
             WHERE id = ?10",
            params![
                outcome.exit_status,
                outcome.client_id.to_string(),
                outcome.client_host,
                outcome.start_time,
                outcome.completion_time,
                waited,
                duration,
                outcome.outpath,
                outcome.errpath,
                id,
            ],
        )
        .context("Failed to record completion")?;
        tx.commit().context("Failed to commit completion")?;
        Ok(CompleteResult::Applied)
    }

    /// Return every scheduled-but-incomplete task to the schedulable state.
    /// Used once at startup in restart mode.
    pub fn revert_incomplete(&mut self) -> Result<usize> {
        let reverted = self
            .conn
            .execute(
                "UPDATE task SET schedule_time = NULL, server_id = NULL, server_host = NULL
                 WHERE schedule_time IS NOT NULL AND exit_status IS NULL",
                [],
            )
            .context("Failed to revert incomplete tasks")?;
        if reverted > 0 {
            info!("Reverted {} abandoned tasks to schedulable", reverted);
        }
        Ok(reverted)
    }

    /// Revert the given task ids unless they have completed. Used when a
    /// client is evicted with bundles still in flight.
    pub fn revert_ids(&mut self, ids: &[Uuid]) -> Result<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin revert")?;
        let mut reverted = 0;
        for id in ids {
            reverted += tx.execute(
                "UPDATE task SET schedule_time = NULL, server_id = NULL, server_host = NULL
                 WHERE id = ?1 AND exit_status IS NULL",
                params![id.to_string()],
            )?;
        }
        tx.commit().context("Failed to commit revert")?;
        Ok(reverted)
    }

    /// Failed tasks eligible for another attempt: complete with a non-zero
    /// status, below the attempts ceiling, and without an existing successor
    /// row. Cancellations are excluded (a retry would undo the cancel), as
    /// are template errors (expansion is deterministic; a retry row would be
    /// re-expanded against a different template than the one that failed).
    pub fn retry_candidates(&mut self, max_attempts: u32, limit: usize) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM task t
             WHERE t.exit_status IS NOT NULL AND t.exit_status != 0
               AND t.exit_status NOT IN ({}, {})
               AND t.attempt < ?1
               AND NOT EXISTS (SELECT 1 FROM task s WHERE s.previous_id = t.id)
             ORDER BY t.submit_time ASC
             LIMIT ?2",
            TASK_COLUMNS, EXIT_STATUS_CANCELLED, EXIT_STATUS_TEMPLATE_ERROR
        );
        let mut candidates = {
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params![max_attempts as i64, limit as i64], row_to_task)?;
            rows.collect::<std::result::Result<Vec<Task>, _>>()
                .context("Failed to load retry candidates")?
        };
        for task in &mut candidates {
            task.tags = self.tags_for(&task.id.to_string())?;
        }
        Ok(candidates)
    }

    /// Fetch one task with its tags.
    pub fn get_task(&mut self, id: Uuid) -> Result<Option<Task>> {
        let id = id.to_string();
        let tx = self.conn.transaction().context("Failed to begin lookup")?;
        let task = get_in_tx(&tx, &id)?;
        tx.commit().ok();
        Ok(task)
    }

    /// Query tasks with an optional SQL predicate and ordering over the task
    /// columns.
    ///
    /// The predicate is an operator surface: callers pass a WHERE fragment
    /// with positional parameters already inlined by the CLI layer.
    pub fn query(
        &mut self,
        predicate: Option<&str>,
        order_by: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let order = order_by.unwrap_or("submit_time ASC");
        let sql = match predicate {
            Some(clause) => format!(
                "SELECT {} FROM task WHERE {} ORDER BY {} LIMIT {}",
                TASK_COLUMNS, clause, order, limit
            ),
            None => format!(
                "SELECT {} FROM task ORDER BY {} LIMIT {}",
                TASK_COLUMNS, order, limit
            ),
        };
        let mut tasks = {
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_task)?;
            rows.collect::<std::result::Result<Vec<Task>, _>>()
                .context("Failed to query tasks")?
        };
        for task in &mut tasks {
            task.tags = self.tags_for(&task.id.to_string())?;
        }
        Ok(tasks)
    }

    /// Update one mutable field on a task. The allowlist is the operator
    /// update surface; scheduling fields stay under scheduler control.
    pub fn update_field(&mut self, id: Uuid, field: &str, value: &str) -> Result<usize> {
        const ALLOWED: &[&str] = &["args", "command", "outpath", "errpath"];
        if !ALLOWED.contains(&field) {
            anyhow::bail!("field '{}' is not operator-updatable", field);
        }
        let updated = self
            .conn
            .execute(
                &format!("UPDATE task SET {} = ?1 WHERE id = ?2", field),
                params![value, id.to_string()],
            )
            .context("Failed to update task")?;
        Ok(updated)
    }

    /// Attach or overwrite a tag.
    pub fn tag(&mut self, id: Uuid, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO task_tag (task_id, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(task_id, key) DO UPDATE SET value = excluded.value",
                params![id.to_string(), key, value],
            )
            .context("Failed to tag task")?;
        Ok(())
    }

    /// Cancel an incomplete task: the scheduler will never claim it again.
    pub fn cancel(&mut self, id: Uuid) -> Result<usize> {
        let cancelled = self
            .conn
            .execute(
                "UPDATE task SET schedule_time = ?1, exit_status = ?2
                 WHERE id = ?3 AND exit_status IS NULL",
                params![current_timestamp(), EXIT_STATUS_CANCELLED, id.to_string()],
            )
            .context("Failed to cancel task")?;
        Ok(cancelled)
    }

    /// Permanently remove a task row and its tags.
    pub fn delete(&mut self, id: Uuid) -> Result<usize> {
        let tx = self.conn.transaction().context("Failed to begin delete")?;
        tx.execute("DELETE FROM task_tag WHERE task_id = ?1", params![id.to_string()])?;
        let deleted = tx.execute("DELETE FROM task WHERE id = ?1", params![id.to_string()])?;
        tx.commit().context("Failed to commit delete")?;
        Ok(deleted)
    }

    /// Number of tasks not yet complete.
    pub fn count_remaining(&mut self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM task WHERE exit_status IS NULL", [], |r| r.get(0))
            .context("Failed to count remaining tasks")
    }

    /// Number of tasks still schedulable.
    pub fn count_schedulable(&mut self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM task WHERE schedule_time IS NULL", [], |r| r.get(0))
            .context("Failed to count schedulable tasks")
    }

    /// Totals logged at shutdown: (submitted, completed, failed).
    pub fn totals(&mut self) -> Result<(i64, i64, i64)> {
        let submitted: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM task", [], |r| r.get(0))?;
        let completed: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM task WHERE exit_status IS NOT NULL",
            [],
            |r| r.get(0),
        )?;
        let failed: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM task WHERE exit_status IS NOT NULL AND exit_status != 0",
            [],
            |r| r.get(0),
        )?;
        Ok((submitted, completed, failed))
    }

    /// Failed tasks with no retry row superseding them. Non-zero here makes
    /// the cluster exit non-zero after drain.
    pub fn count_finally_failed(&mut self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM task t
                 WHERE t.exit_status IS NOT NULL AND t.exit_status != 0
                   AND NOT EXISTS (SELECT 1 FROM task s WHERE s.previous_id = t.id)",
                [],
                |r| r.get(0),
            )
            .context("Failed to count finally-failed tasks")
    }

    /// Average duration in seconds over tasks completed within the rolling
    /// window, or None when the window is empty. Feeds the dynamic
    /// autoscaling policy.
    pub fn recent_avg_duration(&mut self, window_seconds: u64) -> Result<Option<f64>> {
        let cutoff = current_timestamp() - window_seconds as i64;
        self.conn
            .query_row(
                "SELECT AVG(duration) FROM task
                 WHERE exit_status IS NOT NULL AND completion_time >= ?1",
                params![cutoff],
                |r| r.get::<_, Option<f64>>(0),
            )
            .context("Failed to compute rolling average duration")
    }

    fn tags_for(&self, task_id: &str) -> Result<HashMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM task_tag WHERE task_id = ?1")?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut tags = HashMap::new();
        for row in rows {
            let (key, value) = row?;
            tags.insert(key, value);
        }
        Ok(tags)
    }
}

fn insert_in_tx(tx: &Transaction, task: &Task) -> Result<()> {
    tx.execute(
        "INSERT INTO task (id, args, command, submit_id, submit_host, submit_time,
            server_id, server_host, schedule_time, client_id, client_host, start_time,
            completion_time, exit_status, attempt, previous_id, waited, duration,
            outpath, errpath)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
            ?16, ?17, ?18, ?19, ?20)",
        params![
            task.id.to_string(),
            task.args,
            task.command,
            task.submit_id.to_string(),
            task.submit_host,
            task.submit_time,
            task.server_id.map(|v| v.to_string()),
            task.server_host,
            task.schedule_time,
            task.client_id.map(|v| v.to_string()),
            task.client_host,
            task.start_time,
            task.completion_time,
            task.exit_status,
            task.attempt,
            task.previous_id.map(|v| v.to_string()),
            task.waited,
            task.duration,
            task.outpath,
            task.errpath,
        ],
    )
    .context("Failed to insert task")?;
    for (key, value) in &task.tags {
        tx.execute(
            "INSERT INTO task_tag (task_id, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(task_id, key) DO UPDATE SET value = excluded.value",
            params![task.id.to_string(), key, value],
        )
        .context("Failed to insert task tag")?;
    }
    Ok(())
}

fn get_in_tx(tx: &Transaction, id: &str) -> Result<Option<Task>> {
    let sql = format!("SELECT {} FROM task WHERE id = ?1", TASK_COLUMNS);
    let task = tx
        .query_row(&sql, params![id], row_to_task)
        .optional()
        .context("Failed to fetch task")?;
    let Some(mut task) = task else {
        return Ok(None);
    };
    let mut stmt = tx.prepare("SELECT key, value FROM task_tag WHERE task_id = ?1")?;
    let rows = stmt.query_map(params![id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (key, value) = row?;
        task.tags.insert(key, value);
    }
    Ok(Some(task))
}

/// Map one row in `TASK_COLUMNS` order onto the task model.
fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: uuid_column(row, 0)?,
        args: row.get(1)?,
        command: row.get(2)?,
        submit_id: uuid_column(row, 3)?,
        submit_host: row.get(4)?,
        submit_time: row.get(5)?,
        server_id: optional_uuid_column(row, 6)?,
        server_host: row.get(7)?,
        schedule_time: row.get(8)?,
        client_id: optional_uuid_column(row, 9)?,
        client_host: row.get(10)?,
        start_time: row.get(11)?,
        completion_time: row.get(12)?,
        exit_status: row.get(13)?,
        attempt: row.get(14)?,
        previous_id: optional_uuid_column(row, 15)?,
        waited: row.get(16)?,
        duration: row.get(17)?,
        outpath: row.get(18)?,
        errpath: row.get(19)?,
        tags: HashMap::new(),
    })
}

fn uuid_column(row: &Row, index: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(index)?;
    Uuid::parse_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e))
    })
}

fn optional_uuid_column(row: &Row, index: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|value| {
        Uuid::parse_str(&value).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e))
        })
    })
    .transpose()
}
