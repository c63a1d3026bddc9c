//! Client dispatch and completion ingest
//!
//! The dispatcher accepts client connections, performs the authenticated
//! handshake and keeps a live registration per client. Each connection runs
//! an outbound pump (pop the shared queue, send `BundleOut`, await `Ack`
//! unless no-confirm) and an inbound loop (`BundleIn` completions,
//! heartbeats, acks). A periodic sweep evicts registrations that have been
//! silent longer than `server.evict` seconds and recovers their in-flight
//! tasks: reverted in the store in db mode, requeued directly in no-db mode.
//!
//! On drain the dispatcher stops accepting connections, broadcasts
//! `Disconnect` to every registered client and waits for their sockets to
//! close or for eviction.

use anyhow::{Context, Result};
use shared::config::ServerConfig;
use shared::task::{Bundle, Task, TaskOutcome};
use shared::utils::{current_timestamp, hostname};
use shared::wire::{
    read_frame, token_matches, write_frame, write_message, FrameKey, FrameTag, Heartbeat, Hello,
    Welcome,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::database::TaskStore;

/// Handshake must complete within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for clients to close during drain.
const DRAIN_POLL: Duration = Duration::from_millis(500);

/// One registered client.
pub struct Registration {
    pub client_id: Uuid,
    pub client_host: String,
    /// Unix time of the last heartbeat or inbound frame; zero marks the
    /// registration evictable at the next sweep.
    pub last_heartbeat: i64,
    /// Tasks dispatched to this client and not yet returned.
    pub in_flight: HashMap<Uuid, Task>,
    /// Signals the connection's writer to send `Disconnect` and stop.
    kill: mpsc::Sender<()>,
}

/// Registration map shared with the autoscaler; the dispatcher is the only
/// writer.
pub type Registrations = Arc<Mutex<HashMap<Uuid, Registration>>>;

/// Completion totals, the primary record in no-db mode.
#[derive(Default)]
pub struct ServerCounters {
    pub completed: AtomicI64,
    pub failed: AtomicI64,
}

impl ServerCounters {
    pub fn snapshot(&self) -> (i64, i64) {
        (
            self.completed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

/// Context shared by every connection handler.
struct ConnCtx {
    config: ServerConfig,
    key: FrameKey,
    server_id: Uuid,
    server_host: String,
    store: Option<Arc<Mutex<TaskStore>>>,
    queue_rx: Arc<Mutex<mpsc::Receiver<Bundle>>>,
    queue_tx: mpsc::Sender<Bundle>,
    registrations: Registrations,
    failure_sink: Option<PathBuf>,
    counters: Arc<ServerCounters>,
}

pub struct Dispatcher {
    ctx: Arc<ConnCtx>,
    drain: watch::Receiver<bool>,
    shutdown: broadcast::Receiver<()>,
    /// Receives the bound socket address once the listener is up; lets
    /// callers bind port 0 and learn the ephemeral port.
    bound: Option<tokio::sync::oneshot::Sender<std::net::SocketAddr>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ServerConfig,
        server_id: Uuid,
        store: Option<Arc<Mutex<TaskStore>>>,
        queue_rx: Arc<Mutex<mpsc::Receiver<Bundle>>>,
        queue_tx: mpsc::Sender<Bundle>,
        registrations: Registrations,
        failure_sink: Option<PathBuf>,
        counters: Arc<ServerCounters>,
        drain: watch::Receiver<bool>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let key = FrameKey::derive(&config.auth);
        Self {
            ctx: Arc::new(ConnCtx {
                config,
                key,
                server_id,
                server_host: hostname(),
                store,
                queue_rx,
                queue_tx,
                registrations,
                failure_sink,
                counters,
            }),
            drain,
            shutdown,
            bound: None,
        }
    }

    /// Report the bound address through the given channel once listening.
    pub fn notify_bound(&mut self, sender: tokio::sync::oneshot::Sender<std::net::SocketAddr>) {
        self.bound = Some(sender);
    }

    /// Accept connections until drain, then disconnect every client and wait
    /// for them to close.
    pub async fn run(mut self) -> Result<()> {
        let address = format!("{}:{}", self.ctx.config.bind, self.ctx.config.port);
        let listener = TcpListener::bind(&address).await.with_context(|| {
            format!(
                "Failed to bind {}. Check if the port is already in use (EADDRINUSE) \
                 or requires elevated permissions (EACCES).",
                address
            )
        })?;
        info!("Dispatcher listening on {}", address);
        if let Some(sender) = self.bound.take() {
            if let Ok(addr) = listener.local_addr() {
                let _ = sender.send(addr);
            }
        }

        let sweeper = tokio::spawn(eviction_sweep(
            Arc::clone(&self.ctx),
            self.shutdown.resubscribe(),
        ));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("Connection from {}", peer);
                            tokio::spawn(handle_connection(stream, Arc::clone(&self.ctx)));
                        }
                        Err(e) => warn!("Failed to accept connection: {}", e),
                    }
                }
                _ = self.drain.changed() => {
                    if *self.drain.borrow() {
                        info!("Drain requested; no longer accepting clients");
                        break;
                    }
                }
                _ = self.shutdown.recv() => {
                    info!("Dispatcher received shutdown signal");
                    sweeper.abort();
                    return Ok(());
                }
            }
        }

        self.disconnect_all().await;
        sweeper.abort();
        Ok(())
    }

    /// Broadcast `Disconnect` and wait for clients to close (or evict them
    /// once the timeout expires).
    async fn disconnect_all(&self) {
        {
            let registrations = self.ctx.registrations.lock().await;
            info!("Disconnecting {} registered clients", registrations.len());
            for registration in registrations.values() {
                let _ = registration.kill.try_send(());
            }
        }

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.ctx.config.evict.max(1));
        loop {
            if self.ctx.registrations.lock().await.is_empty() {
                info!("All clients disconnected");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        // Stragglers are treated like evicted clients.
        let stragglers: Vec<Registration> = {
            let mut registrations = self.ctx.registrations.lock().await;
            registrations.drain().map(|(_, reg)| reg).collect()
        };
        for registration in stragglers {
            warn!(
                client_id = %registration.client_id,
                "Client did not close during drain; evicting"
            );
            recover_in_flight(&self.ctx, registration).await;
        }
    }
}

/// Handshake, registration, then reader/writer loops until the connection
/// ends.
async fn handle_connection(stream: TcpStream, ctx: Arc<ConnCtx>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let (mut read_half, mut write_half) = stream.into_split();

    let hello = match timeout(HANDSHAKE_TIMEOUT, read_frame(&mut read_half, &ctx.key)).await {
        Ok(Ok(Some(frame))) if frame.tag == FrameTag::Hello => {
            match frame.decode::<Hello>() {
                Ok(hello) => hello,
                Err(e) => {
                    warn!("Malformed handshake from {}: {}", peer, e);
                    return;
                }
            }
        }
        Ok(Ok(_)) => {
            warn!("Peer {} did not open with a handshake", peer);
            return;
        }
        Ok(Err(e)) => {
            warn!("Handshake failed from {}: {}", peer, e);
            return;
        }
        Err(_) => {
            warn!("Handshake timed out from {}", peer);
            return;
        }
    };

    // Token mismatch closes the connection immediately; nothing is leaked
    // back to the peer.
    if !token_matches(&hello.token, &ctx.config.auth) {
        error!("Authentication failure from {} (client {})", peer, hello.client_id);
        return;
    }

    let welcome = Welcome {
        server_id: ctx.server_id,
        server_host: ctx.server_host.clone(),
    };
    if let Err(e) = write_message(&mut write_half, &ctx.key, FrameTag::Welcome, &welcome).await {
        warn!("Failed to welcome client {}: {}", hello.client_id, e);
        return;
    }

    let client_id = hello.client_id;
    let (kill_tx, kill_rx) = mpsc::channel::<()>(1);
    {
        let mut registrations = ctx.registrations.lock().await;
        registrations.insert(
            client_id,
            Registration {
                client_id,
                client_host: hello.client_host.clone(),
                last_heartbeat: current_timestamp(),
                in_flight: HashMap::new(),
                kill: kill_tx,
            },
        );
    }
    info!(
        client_id = %client_id,
        client_host = %hello.client_host,
        "Client registered"
    );

    let (ack_tx, ack_rx) = mpsc::channel::<()>(1);
    let writer = tokio::spawn(outbound_pump(
        write_half,
        Arc::clone(&ctx),
        client_id,
        kill_rx,
        ack_rx,
    ));
    inbound_loop(&mut read_half, &ctx, client_id, ack_tx).await;
    writer.abort();
    let _ = writer.await;
}

/// Pop bundles off the shared queue and push them to this client.
async fn outbound_pump(
    mut write_half: OwnedWriteHalf,
    ctx: Arc<ConnCtx>,
    client_id: Uuid,
    mut kill_rx: mpsc::Receiver<()>,
    mut ack_rx: mpsc::Receiver<()>,
) {
    loop {
        let bundle = tokio::select! {
            biased;
            _ = kill_rx.recv() => {
                let _ = write_frame(&mut write_half, &ctx.key, FrameTag::Disconnect, b"").await;
                debug!(client_id = %client_id, "Sent disconnect");
                return;
            }
            popped = async {
                let mut queue = ctx.queue_rx.lock().await;
                queue.recv().await
            } => match popped {
                Some(bundle) => bundle,
                // Queue closed: the server is tearing down; wait for the kill.
                None => {
                    let _ = kill_rx.recv().await;
                    let _ = write_frame(&mut write_half, &ctx.key, FrameTag::Disconnect, b"").await;
                    return;
                }
            }
        };

        // Attribute the bundle to this client before it hits the wire, so a
        // fast return can never race the bookkeeping.
        {
            let mut registrations = ctx.registrations.lock().await;
            if let Some(registration) = registrations.get_mut(&client_id) {
                for task in &bundle {
                    registration.in_flight.insert(task.id, task.clone());
                }
            }
        }

        if let Err(e) =
            write_message(&mut write_half, &ctx.key, FrameTag::BundleOut, &bundle).await
        {
            warn!(client_id = %client_id, "Failed to send bundle: {}", e);
            {
                let mut registrations = ctx.registrations.lock().await;
                if let Some(registration) = registrations.get_mut(&client_id) {
                    for task in &bundle {
                        registration.in_flight.remove(&task.id);
                    }
                }
            }
            requeue_bundle(&ctx, bundle).await;
            return;
        }
        debug!(client_id = %client_id, tasks = bundle.len(), "Bundle dispatched");

        if !ctx.config.no_confirm {
            // The bundle stays in flight until the client acknowledges it;
            // a silent client is left to the eviction sweep.
            tokio::select! {
                biased;
                _ = kill_rx.recv() => {
                    let _ = write_frame(&mut write_half, &ctx.key, FrameTag::Disconnect, b"").await;
                    return;
                }
                acked = timeout(Duration::from_secs(ctx.config.evict.max(1)), ack_rx.recv()) => {
                    match acked {
                        Ok(Some(())) => {}
                        _ => {
                            warn!(client_id = %client_id, "No delivery acknowledgment; closing");
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Read completions, heartbeats and acks until the peer goes away.
async fn inbound_loop(
    read_half: &mut OwnedReadHalf,
    ctx: &Arc<ConnCtx>,
    client_id: Uuid,
    ack_tx: mpsc::Sender<()>,
) {
    loop {
        match read_frame(read_half, &ctx.key).await {
            Ok(Some(frame)) => match frame.tag {
                FrameTag::BundleIn => match frame.decode::<Bundle>() {
                    Ok(bundle) => ingest_bundle(ctx, client_id, bundle).await,
                    Err(e) => {
                        warn!(client_id = %client_id, "Malformed completion bundle: {}", e);
                        mark_evictable(ctx, client_id).await;
                        return;
                    }
                },
                FrameTag::Heartbeat => {
                    if frame.decode::<Heartbeat>().is_ok() {
                        stamp_heartbeat(ctx, client_id).await;
                    }
                }
                FrameTag::Ack => {
                    let _ = ack_tx.try_send(());
                }
                other => {
                    warn!(client_id = %client_id, "Unexpected {:?} frame; closing", other);
                    mark_evictable(ctx, client_id).await;
                    return;
                }
            },
            Ok(None) => {
                // Clean EOF: a client that returned everything is done;
                // anything still in flight is left to the eviction sweep.
                let mut registrations = ctx.registrations.lock().await;
                let drained = registrations
                    .get(&client_id)
                    .map(|reg| reg.in_flight.is_empty());
                match drained {
                    Some(true) => {
                        registrations.remove(&client_id);
                        info!(client_id = %client_id, "Client disconnected");
                    }
                    Some(false) => {
                        if let Some(registration) = registrations.get_mut(&client_id) {
                            registration.last_heartbeat = 0;
                        }
                        debug!(
                            client_id = %client_id,
                            "Client EOF with tasks in flight; marked evictable"
                        );
                    }
                    None => {}
                }
                return;
            }
            Err(e) => {
                warn!(client_id = %client_id, "Connection error: {}", e);
                mark_evictable(ctx, client_id).await;
                return;
            }
        }
    }
}

/// Apply one returned bundle: record completions, feed the failure sink and
/// release the in-flight attribution.
async fn ingest_bundle(ctx: &Arc<ConnCtx>, client_id: Uuid, bundle: Bundle) {
    let count = bundle.len();
    for task in bundle {
        if task.is_failed() {
            warn!(
                task_id = %task.id,
                exit_status = task.exit_status.unwrap_or_default(),
                args = %task.args,
                "Task failed"
            );
            ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
            if let Some(path) = &ctx.failure_sink {
                append_failure(path, &task.args);
            }
        }
        ctx.counters.completed.fetch_add(1, Ordering::Relaxed);

        if let Some(store) = &ctx.store {
            match TaskOutcome::from_task(&task) {
                Some(outcome) => {
                    let mut store = store.lock().await;
                    if let Err(e) = store.complete(&outcome) {
                        error!(task_id = %task.id, "Failed to record completion: {}", e);
                    }
                }
                None => {
                    warn!(task_id = %task.id, "Returned task missing completion fields");
                }
            }
        }

        let mut registrations = ctx.registrations.lock().await;
        if let Some(registration) = registrations.get_mut(&client_id) {
            registration.in_flight.remove(&task.id);
        }
    }
    debug!(client_id = %client_id, tasks = count, "Completions ingested");
    stamp_heartbeat(ctx, client_id).await;
}

async fn stamp_heartbeat(ctx: &Arc<ConnCtx>, client_id: Uuid) {
    let mut registrations = ctx.registrations.lock().await;
    if let Some(registration) = registrations.get_mut(&client_id) {
        registration.last_heartbeat = current_timestamp();
    }
}

/// Flag the registration for the next eviction sweep.
async fn mark_evictable(ctx: &Arc<ConnCtx>, client_id: Uuid) {
    let mut registrations = ctx.registrations.lock().await;
    if let Some(registration) = registrations.get_mut(&client_id) {
        registration.last_heartbeat = 0;
    }
}

/// Periodic sweep removing registrations silent longer than `server.evict`
/// seconds and recovering their in-flight tasks.
async fn eviction_sweep(ctx: Arc<ConnCtx>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(Duration::from_secs(ctx.config.wait.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.recv() => return,
        }

        let now = current_timestamp();
        let evicted: Vec<Registration> = {
            let mut registrations = ctx.registrations.lock().await;
            let expired: Vec<Uuid> = registrations
                .values()
                .filter(|reg| now - reg.last_heartbeat > ctx.config.evict as i64)
                .map(|reg| reg.client_id)
                .collect();
            expired
                .iter()
                .filter_map(|id| registrations.remove(id))
                .collect()
        };

        for registration in evicted {
            warn!(
                client_id = %registration.client_id,
                client_host = %registration.client_host,
                in_flight = registration.in_flight.len(),
                "Evicting defunct client"
            );
            let _ = registration.kill.try_send(());
            recover_in_flight(&ctx, registration).await;
        }
    }
}

/// Return an evicted client's undelivered work to the schedulable pool.
async fn recover_in_flight(ctx: &Arc<ConnCtx>, registration: Registration) {
    if registration.in_flight.is_empty() {
        return;
    }
    let tasks: Vec<Task> = registration.in_flight.into_values().collect();
    if let Some(store) = &ctx.store {
        let ids: Vec<Uuid> = tasks.iter().map(|task| task.id).collect();
        let mut store = store.lock().await;
        match store.revert_ids(&ids) {
            Ok(reverted) => info!(
                client_id = %registration.client_id,
                reverted,
                "Reverted in-flight tasks of evicted client"
            ),
            Err(e) => error!("Failed to revert tasks of evicted client: {}", e),
        }
    } else {
        // No store to revert into: requeue the task copies directly.
        let queue = ctx.queue_tx.clone();
        let client_id = registration.client_id;
        let count = tasks.len();
        tokio::spawn(async move {
            if queue.send(tasks).await.is_ok() {
                info!(client_id = %client_id, count, "Requeued in-flight tasks of evicted client");
            }
        });
    }
}

/// Return an undeliverable bundle to the pool: reverted in the store when
/// one is in use, requeued directly otherwise.
async fn requeue_bundle(ctx: &Arc<ConnCtx>, bundle: Bundle) {
    if let Some(store) = &ctx.store {
        let ids: Vec<Uuid> = bundle.iter().map(|task| task.id).collect();
        let mut store = store.lock().await;
        if let Err(e) = store.revert_ids(&ids) {
            error!("Failed to revert undelivered bundle: {}", e);
        }
    } else {
        let queue = ctx.queue_tx.clone();
        tokio::spawn(async move {
            let _ = queue.send(bundle).await;
        });
    }
}

fn append_failure(path: &PathBuf, args: &str) {
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{}", args));
    if let Err(e) = result {
        error!("Failed to write failure sink {}: {}", path.display(), e);
    }
}
