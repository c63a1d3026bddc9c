//! Task submission
//!
//! The submitter reads command lines from an input source until EOF,
//! optionally applies the submit-time template, and accumulates tasks into
//! bundles. A bundle is emitted when either `submit.bundlesize` entries are
//! buffered or `submit.bundlewait` seconds have elapsed since the last emit,
//! whichever comes first. The final partial bundle is always flushed before
//! shutdown. In db mode bundles are inserted into the task store; in no-db
//! mode they are published directly onto the outbound queue.

use anyhow::{Context, Result};
use shared::config::SubmitConfig;
use shared::task::{Bundle, Task, EXIT_STATUS_TEMPLATE_ERROR};
use shared::template::Template;
use shared::utils::{current_timestamp, hostname};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::TaskStore;

/// Destination for emitted bundles.
pub enum TaskSink {
    /// Insert into the task store (db mode); the scheduler claims from there.
    Store(Arc<Mutex<TaskStore>>),
    /// Publish directly onto the outbound queue (no-db mode).
    Queue(mpsc::Sender<Bundle>),
}

/// Totals reported when the input source is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitSummary {
    pub submitted: usize,
    pub bundles: usize,
}

/// Reads task lines and emits bundles into the configured sink.
pub struct Submitter {
    config: SubmitConfig,
    sink: TaskSink,
    template: Option<Template>,
    tags: HashMap<String, String>,
    submit_id: Uuid,
    submit_host: String,
}

impl Submitter {
    pub fn new(
        config: SubmitConfig,
        sink: TaskSink,
        template: Option<Template>,
        tags: HashMap<String, String>,
    ) -> Self {
        Self {
            config,
            sink,
            template,
            tags,
            submit_id: Uuid::new_v4(),
            submit_host: hostname(),
        }
    }

    /// Open the input source: "-" is standard input, anything else a file.
    pub async fn open_input(
        path: &str,
    ) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
        if path == "-" {
            Ok(Box::new(BufReader::new(tokio::io::stdin())))
        } else {
            let file = tokio::fs::File::open(Path::new(path))
                .await
                .with_context(|| format!("Failed to open task input: {}", path))?;
            Ok(Box::new(BufReader::new(file)))
        }
    }

    /// Consume the input source until EOF.
    ///
    /// Blank lines and `#` comments are skipped. The bundlewait clock starts
    /// when the first task of a bundle is buffered; `bundlewait = 0` flushes
    /// after every line.
    pub async fn run<R: AsyncBufRead + Unpin + Send>(
        mut self,
        input: R,
    ) -> Result<SubmitSummary> {
        let mut lines = input.lines();
        let mut buffer: Bundle = Vec::with_capacity(self.config.bundlesize);
        let mut summary = SubmitSummary {
            submitted: 0,
            bundles: 0,
        };
        let wait = Duration::from_secs(self.config.bundlewait);
        let mut deadline = Instant::now() + wait;

        loop {
            let line = if buffer.is_empty() {
                lines.next_line().await.context("Failed to read task input")?
            } else {
                match timeout_at(deadline, lines.next_line()).await {
                    Ok(result) => result.context("Failed to read task input")?,
                    Err(_) => {
                        // Wait expired with a partial bundle buffered.
                        self.flush(&mut buffer, &mut summary).await?;
                        deadline = Instant::now() + wait;
                        continue;
                    }
                }
            };

            let Some(line) = line else {
                break;
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if buffer.is_empty() {
                deadline = Instant::now() + wait;
            }
            buffer.push(self.build_task(trimmed).await);

            if buffer.len() >= self.config.bundlesize || self.config.bundlewait == 0 {
                self.flush(&mut buffer, &mut summary).await?;
                deadline = Instant::now() + wait;
            }
        }

        // EOF: the final partial bundle is always emitted.
        self.flush(&mut buffer, &mut summary).await?;
        info!(
            submitted = summary.submitted,
            bundles = summary.bundles,
            "Submission complete"
        );
        Ok(summary)
    }

    async fn build_task(&self, args: &str) -> Task {
        let mut task = Task::new(args, self.submit_id, self.submit_host.clone());
        task.tags = self.tags.clone();
        if let Some(template) = &self.template {
            match template.expand(args).await {
                Ok(command) => task.command = Some(command),
                Err(e) => {
                    // Template errors are task-local: the row is submitted
                    // already complete-and-failed and the rest of the input
                    // keeps flowing.
                    warn!(task_id = %task.id, args = %task.args, "Template expansion failed: {}", e);
                    let now = current_timestamp();
                    task.schedule_time = Some(now);
                    task.completion_time = Some(now);
                    task.exit_status = Some(EXIT_STATUS_TEMPLATE_ERROR);
                }
            }
        }
        task
    }

    async fn flush(&mut self, buffer: &mut Bundle, summary: &mut SubmitSummary) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let bundle = std::mem::take(buffer);
        summary.submitted += bundle.len();
        summary.bundles += 1;
        debug!(tasks = bundle.len(), "Emitting bundle");
        match &self.sink {
            TaskSink::Store(store) => {
                let mut store = store.lock().await;
                store.insert(&bundle)?;
            }
            TaskSink::Queue(queue) => {
                queue
                    .send(bundle)
                    .await
                    .map_err(|_| anyhow::anyhow!("outbound queue closed during submission"))?;
            }
        }
        Ok(())
    }
}
