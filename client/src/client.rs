//! Worker client
//!
//! The client connects to the server, registers through the authenticated
//! handshake and then runs four cooperating loops: the puller reads
//! `BundleOut` frames and hands tasks to the executor pool one at a time,
//! acknowledging each bundle once fully handed off; the executors run the
//! shell processes; the collector accumulates finished tasks into return
//! bundles flushed on size or wait; the heartbeat ticker keeps the
//! registration alive. The client drains on server `Disconnect`, on idle
//! timeout, or on SIGINT; SIGUSR1 forces executors down the signal
//! escalation ladder first.

use anyhow::{Context, Result};
use shared::config::Settings;
use shared::task::{Bundle, Task};
use shared::utils::{current_timestamp, format_seconds, hostname};
use shared::wire::{
    read_frame, write_message, FrameKey, FrameTag, Heartbeat, Hello, Welcome,
};
use shared::HyperShellError;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::executor::{execute_task, ExecutorContext};

/// Connection attempts before giving up on the server.
const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY: Duration = Duration::from_secs(2);

/// Handshake must complete within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Ready,
    Running,
    Draining,
    Done,
}

/// Totals reported when the client finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSummary {
    pub completed: usize,
    pub failed: usize,
}

/// Frames queued for the single writer task.
enum Outgoing {
    Bundle(Bundle),
    Heartbeat,
    Ack,
}

pub struct Client {
    settings: Settings,
    context: ExecutorContext,
    client_id: Uuid,
    state: ClientState,
}

impl Client {
    pub fn new(settings: Settings, context: ExecutorContext) -> Self {
        let client_id = context.client_id;
        Self {
            settings,
            context,
            client_id,
            state: ClientState::Connecting,
        }
    }

    fn transition(&mut self, state: ClientState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Client state change");
            self.state = state;
        }
    }

    /// Connect, register, process bundles until drained. Returns the
    /// completion totals.
    pub async fn run(mut self) -> Result<ClientSummary> {
        let address = format!("{}:{}", self.settings.server.bind, self.settings.server.port);
        let key = FrameKey::derive(&self.settings.server.auth);
        let started = Instant::now();

        info!(client_id = %self.client_id, server = %address, "Client connecting");
        let stream = connect_with_retry(&address).await?;
        let (mut read_half, mut write_half) = stream.into_split();

        // Handshake: announce ourselves, prove the shared secret, wait for
        // the server's welcome. A closed stream here is an auth rejection.
        let hello = Hello {
            client_id: self.client_id,
            client_host: hostname(),
            token: self.settings.server.auth.clone(),
        };
        write_message(&mut write_half, &key, FrameTag::Hello, &hello).await?;
        let welcome = match timeout(HANDSHAKE_TIMEOUT, read_frame(&mut read_half, &key)).await {
            Ok(Ok(Some(frame))) if frame.tag == FrameTag::Welcome => frame.decode::<Welcome>()?,
            Ok(Ok(None)) => {
                return Err(HyperShellError::Auth(
                    "server closed the connection during handshake".to_string(),
                )
                .into())
            }
            Ok(Ok(Some(frame))) => {
                return Err(HyperShellError::Transport(format!(
                    "unexpected {:?} frame during handshake",
                    frame.tag
                ))
                .into())
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(HyperShellError::Transport(
                    "handshake timed out".to_string(),
                )
                .into())
            }
        };
        self.transition(ClientState::Ready);
        info!(
            server_id = %welcome.server_id,
            server_host = %welcome.server_host,
            "Client registered"
        );

        let num_tasks = self.settings.client.num_tasks.max(1);
        let (task_tx, task_rx) = mpsc::channel::<Task>(1);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (done_tx, done_rx) = mpsc::channel::<Task>(num_tasks * 2);
        let (out_tx, out_rx) = mpsc::channel::<Outgoing>(8);
        let (force_tx, _) = broadcast::channel::<()>(1);
        let last_activity = Arc::new(AtomicI64::new(current_timestamp()));

        // Writer: the single owner of the write half.
        let writer = tokio::spawn(writer_loop(
            write_half,
            key.clone(),
            self.client_id,
            out_rx,
        ));

        // Heartbeat ticker.
        let heartbeat = tokio::spawn(heartbeat_loop(
            out_tx.clone(),
            self.settings.client.heartrate.max(1),
        ));

        // Executor pool.
        let mut executors = Vec::with_capacity(num_tasks);
        for slot in 0..num_tasks {
            let context = self.context.clone();
            let task_rx = Arc::clone(&task_rx);
            let done_tx = done_tx.clone();
            let mut force = force_tx.subscribe();
            executors.push(tokio::spawn(async move {
                debug!(slot, "Executor started");
                loop {
                    let task = {
                        let mut receiver = task_rx.lock().await;
                        receiver.recv().await
                    };
                    let Some(task) = task else {
                        break;
                    };
                    let finished = execute_task(&context, task, &mut force).await;
                    if done_tx.send(finished).await.is_err() {
                        break;
                    }
                }
                debug!(slot, "Executor stopped");
            }));
        }
        drop(done_tx);

        // Collector: return-bundle accumulation.
        let collector = tokio::spawn(collector_loop(
            done_rx,
            out_tx.clone(),
            self.settings.client.bundlesize.max(1),
            self.settings.client.bundlewait,
            Arc::clone(&last_activity),
        ));

        // Pull loop on this task; everything else reacts to it.
        let drain_reason = self
            .pull_loop(&mut read_half, &key, task_tx, out_tx, &force_tx, &last_activity)
            .await;
        self.transition(ClientState::Draining);
        info!(reason = drain_reason, "Client draining");

        // The pull loop dropped the task sender: executors finish their
        // in-flight work and stop, then the collector flushes the final
        // bundle, then the writer drains its queue and closes the socket.
        for executor in executors {
            let _ = executor.await;
        }
        let summary = match collector.await {
            Ok(summary) => summary,
            Err(e) => {
                warn!("Collector panicked: {}", e);
                ClientSummary {
                    completed: 0,
                    failed: 0,
                }
            }
        };
        heartbeat.abort();
        let _ = writer.await;

        self.transition(ClientState::Done);
        info!(
            completed = summary.completed,
            failed = summary.failed,
            elapsed = %format_seconds(started.elapsed().as_secs() as i64),
            "Client finished"
        );
        Ok(summary)
    }

    /// Read frames and hand tasks to the executors until a drain condition.
    /// Returns the reason for draining.
    async fn pull_loop(
        &mut self,
        read_half: &mut OwnedReadHalf,
        key: &FrameKey,
        task_tx: mpsc::Sender<Task>,
        out_tx: mpsc::Sender<Outgoing>,
        force_tx: &broadcast::Sender<()>,
        last_activity: &Arc<AtomicI64>,
    ) -> &'static str {
        let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!("Failed to register SIGINT handler: {}", e);
                None
            }
        };
        let mut sigusr1 = match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::user_defined1(),
        ) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!("Failed to register SIGUSR1 handler: {}", e);
                None
            }
        };

        loop {
            let idle_limit = self.settings.client.timeout;
            let frame = tokio::select! {
                frame = read_frame(read_half, key) => frame,
                _ = async {
                    match &mut sigint {
                        Some(signal) => { signal.recv().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    info!("SIGINT received");
                    return "interrupt";
                }
                _ = async {
                    match &mut sigusr1 {
                        Some(signal) => { signal.recv().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    info!("SIGUSR1 received; forcing executors down");
                    let _ = force_tx.send(());
                    return "forced";
                }
                _ = async {
                    match idle_limit {
                        Some(limit) => tokio::time::sleep(Duration::from_secs(limit)).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let idle_for = current_timestamp() - last_activity.load(Ordering::Relaxed);
                    if idle_for >= idle_limit.unwrap_or(u64::MAX) as i64 {
                        info!(idle_for, "Idle timeout reached");
                        return "idle";
                    }
                    continue;
                }
            };

            match frame {
                Ok(Some(frame)) => match frame.tag {
                    FrameTag::BundleOut => {
                        let bundle: Bundle = match frame.decode() {
                            Ok(bundle) => bundle,
                            Err(e) => {
                                warn!("Malformed bundle from server: {}", e);
                                return "protocol error";
                            }
                        };
                        self.transition(ClientState::Running);
                        last_activity.store(current_timestamp(), Ordering::Relaxed);
                        debug!(tasks = bundle.len(), "Bundle received");
                        for task in bundle {
                            // Blocks until an executor slot frees up; this is
                            // the pull policy — never buffer more than one
                            // undispatched bundle.
                            if task_tx.send(task).await.is_err() {
                                return "executors stopped";
                            }
                        }
                        if out_tx.send(Outgoing::Ack).await.is_err() {
                            return "writer stopped";
                        }
                    }
                    FrameTag::Disconnect => {
                        info!("Disconnect received from server");
                        return "disconnect";
                    }
                    other => {
                        warn!("Unexpected {:?} frame from server", other);
                        return "protocol error";
                    }
                },
                Ok(None) => {
                    info!("Server closed the connection");
                    return "server eof";
                }
                Err(e) => {
                    warn!("Connection error: {}", e);
                    return "transport error";
                }
            }
        }
    }
}

async fn connect_with_retry(address: &str) -> Result<TcpStream> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match TcpStream::connect(address).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!(
                    "Connection attempt {}/{} failed: {}",
                    attempt, CONNECT_ATTEMPTS, e
                );
                tokio::time::sleep(CONNECT_RETRY).await;
            }
            Err(e) => {
                return Err(HyperShellError::Transport(format!(
                    "cannot reach server at {}: {}",
                    address, e
                )))
                .context("Connection failed after retries");
            }
        }
    }
}

/// Single writer over the socket: bundles, heartbeats and acks in arrival
/// order. Ends when every sender is gone, closing the stream.
async fn writer_loop(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    key: FrameKey,
    client_id: Uuid,
    mut out_rx: mpsc::Receiver<Outgoing>,
) {
    while let Some(outgoing) = out_rx.recv().await {
        let result = match outgoing {
            Outgoing::Bundle(bundle) => {
                write_message(&mut write_half, &key, FrameTag::BundleIn, &bundle).await
            }
            Outgoing::Heartbeat => {
                write_message(&mut write_half, &key, FrameTag::Heartbeat, &Heartbeat { client_id })
                    .await
            }
            Outgoing::Ack => {
                shared::wire::write_frame(&mut write_half, &key, FrameTag::Ack, b"").await
            }
        };
        if let Err(e) = result {
            warn!("Failed to write to server: {}", e);
            return;
        }
    }
}

async fn heartbeat_loop(out_tx: mpsc::Sender<Outgoing>, heartrate: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(heartrate));
    interval.tick().await;
    loop {
        interval.tick().await;
        if out_tx.send(Outgoing::Heartbeat).await.is_err() {
            return;
        }
    }
}

/// Accumulate finished tasks and flush return bundles on size or wait.
async fn collector_loop(
    mut done_rx: mpsc::Receiver<Task>,
    out_tx: mpsc::Sender<Outgoing>,
    bundlesize: usize,
    bundlewait: u64,
    last_activity: Arc<AtomicI64>,
) -> ClientSummary {
    let mut buffer: Bundle = Vec::with_capacity(bundlesize);
    let mut summary = ClientSummary {
        completed: 0,
        failed: 0,
    };
    let wait = Duration::from_secs(bundlewait);
    let mut deadline = Instant::now() + wait;

    loop {
        let task = if buffer.is_empty() {
            done_rx.recv().await
        } else {
            match timeout_at(deadline, done_rx.recv()).await {
                Ok(task) => task,
                Err(_) => {
                    flush(&mut buffer, &out_tx).await;
                    deadline = Instant::now() + wait;
                    continue;
                }
            }
        };

        let Some(task) = task else {
            break;
        };
        summary.completed += 1;
        if task.is_failed() {
            summary.failed += 1;
        }
        last_activity.store(current_timestamp(), Ordering::Relaxed);

        if buffer.is_empty() {
            deadline = Instant::now() + wait;
        }
        buffer.push(task);
        if buffer.len() >= bundlesize || bundlewait == 0 {
            flush(&mut buffer, &out_tx).await;
            deadline = Instant::now() + wait;
        }
    }

    // Final return bundle is always flushed before disconnect.
    flush(&mut buffer, &out_tx).await;
    summary
}

async fn flush(buffer: &mut Bundle, out_tx: &mpsc::Sender<Outgoing>) {
    if buffer.is_empty() {
        return;
    }
    let bundle = std::mem::take(buffer);
    debug!(tasks = bundle.len(), "Returning bundle");
    if out_tx.send(Outgoing::Bundle(bundle)).await.is_err() {
        warn!("Writer gone; dropping return bundle");
    }
}
