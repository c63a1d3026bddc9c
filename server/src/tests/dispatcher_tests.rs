//! Integration tests for the dispatcher over local TCP

use crate::database::TaskStore;
use crate::dispatcher::{Dispatcher, Registrations, ServerCounters};
use shared::config::ServerConfig;
use shared::task::{Bundle, Task};
use shared::utils::current_timestamp;
use shared::wire::{read_frame, write_frame, write_message, FrameKey, FrameTag, Hello, Welcome};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

const AUTH: &str = "test-secret";

struct Harness {
    addr: SocketAddr,
    queue_tx: mpsc::Sender<Bundle>,
    queue_rx: Arc<Mutex<mpsc::Receiver<Bundle>>>,
    registrations: Registrations,
    counters: Arc<ServerCounters>,
    drain_tx: watch::Sender<bool>,
    shutdown_tx: broadcast::Sender<()>,
    dispatcher: tokio::task::JoinHandle<anyhow::Result<()>>,
}

fn test_config(evict: u64, no_confirm: bool) -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1".to_string(),
        port: 0,
        auth: AUTH.to_string(),
        evict,
        wait: 1,
        no_confirm,
        ..ServerConfig::default()
    }
}

async fn start(
    config: ServerConfig,
    store: Option<Arc<Mutex<TaskStore>>>,
    failure_sink: Option<std::path::PathBuf>,
) -> Harness {
    let (queue_tx, queue_rx) = mpsc::channel::<Bundle>(config.queuesize);
    let queue_rx = Arc::new(Mutex::new(queue_rx));
    let registrations: Registrations = Arc::new(Mutex::new(HashMap::new()));
    let counters = Arc::new(ServerCounters::default());
    let (drain_tx, drain_rx) = watch::channel(false);
    let (shutdown_tx, _) = broadcast::channel(1);
    let (bound_tx, bound_rx) = oneshot::channel();

    let mut dispatcher = Dispatcher::new(
        config,
        Uuid::new_v4(),
        store,
        Arc::clone(&queue_rx),
        queue_tx.clone(),
        Arc::clone(&registrations),
        failure_sink,
        Arc::clone(&counters),
        drain_rx,
        shutdown_tx.subscribe(),
    );
    dispatcher.notify_bound(bound_tx);
    let handle = tokio::spawn(dispatcher.run());
    let addr = timeout(Duration::from_secs(5), bound_rx)
        .await
        .expect("dispatcher should bind")
        .unwrap();

    Harness {
        addr,
        queue_tx,
        queue_rx,
        registrations,
        counters,
        drain_tx,
        shutdown_tx,
        dispatcher: handle,
    }
}

/// Connect and perform the client side of the handshake.
async fn connect(
    addr: SocketAddr,
    token: &str,
) -> (OwnedReadHalf, OwnedWriteHalf, FrameKey, Uuid) {
    let key = FrameKey::derive(AUTH);
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let client_id = Uuid::new_v4();
    let hello = Hello {
        client_id,
        client_host: "test-client".to_string(),
        token: token.to_string(),
    };
    write_message(&mut write_half, &key, FrameTag::Hello, &hello)
        .await
        .unwrap();
    (read_half, write_half, key, client_id)
}

/// Completed copy of a dispatched task.
fn finish(task: &Task, client_id: Uuid, exit_status: i64) -> Task {
    let mut task = task.clone();
    let now = current_timestamp();
    task.client_id = Some(client_id);
    task.client_host = Some("test-client".to_string());
    task.start_time = Some(now);
    task.completion_time = Some(now + 1);
    task.exit_status = Some(exit_status);
    task
}

fn new_bundle(args: &[&str]) -> Bundle {
    let submit_id = Uuid::new_v4();
    args.iter().map(|a| Task::new(*a, submit_id, "host")).collect()
}

#[tokio::test]
async fn test_dispatch_and_completion_flow() {
    let dir = TempDir::new().unwrap();
    let failures = dir.path().join("failures.txt");
    let harness = start(test_config(10, false), None, Some(failures.clone())).await;

    let (mut read_half, mut write_half, key, client_id) = connect(harness.addr, AUTH).await;
    let welcome = timeout(Duration::from_secs(5), read_frame(&mut read_half, &key))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(welcome.tag, FrameTag::Welcome);
    welcome.decode::<Welcome>().unwrap();

    // Registration exists once the handshake completes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.registrations.lock().await.contains_key(&client_id));

    // Dispatch a bundle and receive it as the client.
    harness
        .queue_tx
        .send(new_bundle(&["true", "false"]))
        .await
        .unwrap();
    let frame = timeout(Duration::from_secs(5), read_frame(&mut read_half, &key))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame.tag, FrameTag::BundleOut);
    let bundle: Bundle = frame.decode().unwrap();
    assert_eq!(bundle.len(), 2);

    // Acknowledge delivery and return the completed bundle.
    write_frame(&mut write_half, &key, FrameTag::Ack, b"").await.unwrap();
    let returned: Bundle = vec![
        finish(&bundle[0], client_id, 0),
        finish(&bundle[1], client_id, 1),
    ];
    write_message(&mut write_half, &key, FrameTag::BundleIn, &returned)
        .await
        .unwrap();

    // The receiver records the completions and feeds the failure sink.
    timeout(Duration::from_secs(5), async {
        loop {
            if harness.counters.snapshot().0 == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("completions should be ingested");
    assert_eq!(harness.counters.snapshot(), (2, 1));

    // Drain: the server says goodbye, the client closes, the dispatcher
    // returns.
    harness.drain_tx.send(true).unwrap();
    let frame = timeout(Duration::from_secs(5), read_frame(&mut read_half, &key))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame.tag, FrameTag::Disconnect);
    drop(read_half);
    drop(write_half);

    timeout(Duration::from_secs(10), harness.dispatcher)
        .await
        .expect("dispatcher should finish the drain")
        .unwrap()
        .unwrap();
    assert!(harness.registrations.lock().await.is_empty());

    let sink = std::fs::read_to_string(&failures).unwrap();
    assert_eq!(sink, "false\n");
}

#[tokio::test]
async fn test_wrong_token_is_rejected() {
    let harness = start(test_config(10, false), None, None).await;

    let (mut read_half, _write_half, key, client_id) = connect(harness.addr, "wrong").await;
    // The server closes without a word.
    let frame = timeout(Duration::from_secs(5), read_frame(&mut read_half, &key))
        .await
        .unwrap()
        .unwrap();
    assert!(frame.is_none());
    assert!(!harness.registrations.lock().await.contains_key(&client_id));

    harness.shutdown_tx.send(()).unwrap();
    let _ = timeout(Duration::from_secs(5), harness.dispatcher).await;
}

#[tokio::test]
async fn test_silent_client_is_evicted_and_work_requeued() {
    let harness = start(test_config(1, true), None, None).await;

    let (mut read_half, _write_half, key, client_id) = connect(harness.addr, AUTH).await;
    let welcome = timeout(Duration::from_secs(5), read_frame(&mut read_half, &key))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(welcome.tag, FrameTag::Welcome);

    harness
        .queue_tx
        .send(new_bundle(&["echo 1", "echo 2", "echo 3", "echo 4"]))
        .await
        .unwrap();
    let frame = timeout(Duration::from_secs(5), read_frame(&mut read_half, &key))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame.tag, FrameTag::BundleOut);

    // Say nothing: no ack, no heartbeat, no completions. After `evict`
    // seconds of silence the registration goes away and the undelivered
    // work returns to the queue.
    let requeued = timeout(Duration::from_secs(15), async {
        let mut queue = harness.queue_rx.lock().await;
        queue.recv().await
    })
    .await
    .expect("evicted work should be requeued")
    .unwrap();
    assert_eq!(requeued.len(), 4);
    assert!(!harness.registrations.lock().await.contains_key(&client_id));

    harness.shutdown_tx.send(()).unwrap();
    let _ = timeout(Duration::from_secs(5), harness.dispatcher).await;
}

#[tokio::test]
async fn test_evicted_client_tasks_revert_in_store() {
    let dir = TempDir::new().unwrap();
    let mut store = TaskStore::open(&dir.path().join("task.db")).unwrap();
    store.initialize().unwrap();
    let tasks = new_bundle(&["a", "b", "c", "d"]);
    store.insert(&tasks).unwrap();
    let claimed = store.claim_next(4, false, Uuid::new_v4(), "host").unwrap();
    assert_eq!(store.count_schedulable().unwrap(), 0);
    let store = Arc::new(Mutex::new(store));

    let harness = start(test_config(1, true), Some(Arc::clone(&store)), None).await;
    let (mut read_half, _write_half, key, _client_id) = connect(harness.addr, AUTH).await;
    timeout(Duration::from_secs(5), read_frame(&mut read_half, &key))
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    harness.queue_tx.send(claimed).await.unwrap();
    let frame = timeout(Duration::from_secs(5), read_frame(&mut read_half, &key))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame.tag, FrameTag::BundleOut);

    // Silence until eviction, then every dispatched task is schedulable
    // again.
    timeout(Duration::from_secs(15), async {
        loop {
            if store.lock().await.count_schedulable().unwrap() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await
    .expect("evicted tasks should revert");

    harness.shutdown_tx.send(()).unwrap();
    let _ = timeout(Duration::from_secs(5), harness.dispatcher).await;
}
