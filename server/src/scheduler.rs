//! Database-backed task scheduling
//!
//! The scheduler runs only when a task store is in use. Each pass it sizes
//! its claim to the free capacity of the outbound queue, claims that many
//! schedulable rows in one transaction, partitions them into bundles and
//! publishes them. When the store runs dry it inserts retry rows for failed
//! tasks (when enabled), and once the submitter has finished and every task
//! has completed it initiates drain — unless running forever.

use anyhow::{Context, Result};
use shared::config::ServerConfig;
use shared::task::Bundle;
use shared::utils::{calculate_backoff_delay, hostname};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::database::TaskStore;

/// Pause between passes when the queue is full.
const QUEUE_FULL_PAUSE_MS: u64 = 250;

/// Backoff bounds for transient database failures.
const DB_RETRY_BASE_MS: u64 = 500;
const DB_RETRY_MAX_MS: u64 = 30_000;

pub struct Scheduler {
    config: ServerConfig,
    store: Arc<Mutex<TaskStore>>,
    queue: mpsc::Sender<Bundle>,
    server_id: Uuid,
    server_host: String,
    /// True once the submitter has consumed its input.
    submitter_done: watch::Receiver<bool>,
    /// Written when the scheduler decides the workload is drained.
    drain: watch::Sender<bool>,
    /// Observed so an externally requested drain (signal handling) stops
    /// the claim loop too.
    drain_rx: watch::Receiver<bool>,
    /// Keep claiming even when the store runs dry.
    forever: bool,
    shutdown: broadcast::Receiver<()>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ServerConfig,
        store: Arc<Mutex<TaskStore>>,
        queue: mpsc::Sender<Bundle>,
        server_id: Uuid,
        submitter_done: watch::Receiver<bool>,
        drain: watch::Sender<bool>,
        drain_rx: watch::Receiver<bool>,
        forever: bool,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            server_id,
            server_host: hostname(),
            submitter_done,
            drain,
            drain_rx,
            forever,
            shutdown,
        }
    }

    /// Revert abandoned rows from a previous run. Called once before the
    /// loop when the server starts in restart mode.
    pub async fn revert_abandoned(&self) -> Result<usize> {
        let mut store = self.store.lock().await;
        store.revert_incomplete()
    }

    /// Main scheduling loop. Returns once drain has been signalled.
    pub async fn run(mut self) -> Result<()> {
        info!("Scheduler started");
        let mut drain_watch = self.drain_rx.clone();
        let mut db_failures: u32 = 0;
        let mut db_backoff_total_ms: u64 = 0;

        loop {
            if self.shutdown.try_recv().is_ok() {
                info!("Scheduler received shutdown signal");
                return Ok(());
            }
            if *self.drain_rx.borrow() {
                info!("Drain requested; scheduler stopping");
                return Ok(());
            }

            let demand = self.queue.capacity();
            if demand == 0 {
                tokio::time::sleep(Duration::from_millis(QUEUE_FULL_PAUSE_MS)).await;
                continue;
            }

            let claimed = match self.claim(self.config.bundlesize * demand).await {
                Ok(claimed) => {
                    db_failures = 0;
                    db_backoff_total_ms = 0;
                    claimed
                }
                Err(e) => {
                    // Transient database failures retry with bounded backoff
                    // and only surface once persistent.
                    db_failures += 1;
                    let delay = calculate_backoff_delay(db_failures, DB_RETRY_BASE_MS, DB_RETRY_MAX_MS);
                    db_backoff_total_ms = db_backoff_total_ms.saturating_add(delay);
                    if db_backoff_total_ms > self.config.evict * 1000 {
                        error!("Persistent database failure in scheduler: {}", e);
                        // Unblock the server so it can shut down cleanly.
                        let _ = self.drain.send(true);
                        return Err(e);
                    }
                    warn!(
                        "Database error while claiming (attempt {}): {}",
                        db_failures, e
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    continue;
                }
            };

            if !claimed.is_empty() {
                debug!(tasks = claimed.len(), "Claimed tasks for dispatch");
                for bundle in claimed.chunks(self.config.bundlesize) {
                    // Blocks when the queue is full; that backpressure is the
                    // contract between scheduler and dispatcher. An external
                    // drain releases the block so shutdown cannot wedge here.
                    tokio::select! {
                        sent = self.queue.send(bundle.to_vec()) => {
                            if sent.is_err() {
                                info!("Outbound queue closed; scheduler stopping");
                                return Ok(());
                            }
                        }
                        _ = drain_watch.wait_for(|drained| *drained) => {
                            info!("Drain requested while enqueueing; scheduler stopping");
                            return Ok(());
                        }
                    }
                }
                continue;
            }

            // Store ran dry: insert retries for failed tasks when enabled.
            if self.config.attempts > 1 {
                let inserted = self.insert_retries(self.config.bundlesize * demand).await?;
                if inserted > 0 {
                    info!("Scheduled {} retry tasks", inserted);
                    continue;
                }
            }

            if self.should_drain().await? {
                info!("Workload complete; initiating drain");
                let _ = self.drain.send(true);
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.wait)) => {}
                _ = self.shutdown.recv() => {
                    info!("Scheduler received shutdown signal");
                    return Ok(());
                }
            }
        }
    }

    async fn claim(&self, count: usize) -> Result<Vec<shared::Task>> {
        let mut store = self.store.lock().await;
        store
            .claim_next(count, self.config.eager, self.server_id, &self.server_host)
            .context("Failed to claim schedulable tasks")
    }

    /// Create retry rows for failed tasks below the attempts ceiling.
    async fn insert_retries(&self, limit: usize) -> Result<usize> {
        let mut store = self.store.lock().await;
        let candidates = store.retry_candidates(self.config.attempts, limit)?;
        if candidates.is_empty() {
            return Ok(0);
        }
        let retries: Vec<shared::Task> = candidates.iter().map(|task| task.retry()).collect();
        for (failed, retry) in candidates.iter().zip(&retries) {
            debug!(
                original = %failed.id,
                retry = %retry.id,
                attempt = retry.attempt,
                "Retrying failed task"
            );
        }
        store.insert(&retries)?;
        Ok(retries.len())
    }

    /// The workload is drained when the submitter has finished, nothing is
    /// incomplete, and the scheduler is not running forever. Tasks still in
    /// flight or awaiting retry keep the loop alive.
    async fn should_drain(&self) -> Result<bool> {
        if self.forever || !*self.submitter_done.borrow() {
            return Ok(false);
        }
        let mut store = self.store.lock().await;
        Ok(store.count_remaining()? == 0)
    }
}
