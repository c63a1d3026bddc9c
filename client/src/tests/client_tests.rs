//! Integration tests for the client against a scripted server

use crate::client::Client;
use crate::executor::{ExecutorContext, OutputMode};
use shared::config::Settings;
use shared::task::{Bundle, Task};
use shared::template::Template;
use shared::wire::{
    read_frame, write_frame, write_message, FrameKey, FrameTag, Hello, Welcome,
};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

fn test_settings(port: u16, num_tasks: usize) -> Settings {
    let mut settings = Settings::default();
    settings.server.bind = "127.0.0.1".to_string();
    settings.server.port = port;
    settings.client.num_tasks = num_tasks;
    settings.client.bundlesize = 2;
    settings.client.bundlewait = 1;
    settings.client.heartrate = 1;
    settings
}

fn test_context(dir: &TempDir, settings: &Settings) -> ExecutorContext {
    ExecutorContext {
        client_id: Uuid::new_v4(),
        client_host: "test-client".to_string(),
        template: Template::new("echo {}"),
        config: settings.task.clone(),
        output: OutputMode::Capture,
        lib_dir: dir.path().join("lib"),
        exports: Vec::new(),
    }
}

fn new_bundle(args: &[&str]) -> Bundle {
    let submit_id = Uuid::new_v4();
    args.iter().map(|a| Task::new(*a, submit_id, "host")).collect()
}

/// Server side of the handshake.
async fn accept_client(listener: &TcpListener, key: &FrameKey) -> (TcpStream, Hello) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let frame = read_frame(&mut stream, key).await.unwrap().unwrap();
    assert_eq!(frame.tag, FrameTag::Hello);
    let hello: Hello = frame.decode().unwrap();
    let welcome = Welcome {
        server_id: Uuid::new_v4(),
        server_host: "test-server".to_string(),
    };
    write_message(&mut stream, key, FrameTag::Welcome, &welcome)
        .await
        .unwrap();
    (stream, hello)
}

#[tokio::test]
async fn test_client_runs_bundle_and_returns_completions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = TempDir::new().unwrap();

    let settings = test_settings(port, 2);
    let key = FrameKey::derive(&settings.server.auth);
    let context = test_context(&dir, &settings);
    let client = tokio::spawn(Client::new(settings, context).run());

    let (mut stream, hello) = accept_client(&listener, &key).await;
    assert!(shared::wire::token_matches(
        &hello.token,
        &Settings::default().server.auth
    ));

    // Dispatch four tasks; the client acknowledges the bundle once it is
    // handed to the executors.
    let bundle = new_bundle(&["1", "2", "3", "4"]);
    write_message(&mut stream, &key, FrameTag::BundleOut, &bundle)
        .await
        .unwrap();

    let mut acked = false;
    let mut returned: Vec<Task> = Vec::new();
    while returned.len() < 4 {
        let frame = timeout(Duration::from_secs(15), read_frame(&mut stream, &key))
            .await
            .expect("server should keep receiving frames")
            .unwrap()
            .unwrap();
        match frame.tag {
            FrameTag::Ack => acked = true,
            FrameTag::Heartbeat => {}
            FrameTag::BundleIn => {
                let bundle: Bundle = frame.decode().unwrap();
                returned.extend(bundle);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert!(acked);

    for task in &returned {
        assert_eq!(task.exit_status, Some(0));
        assert_eq!(task.client_id, Some(hello.client_id));
        assert!(task.command.as_deref().unwrap().starts_with("echo "));
        assert!(task.start_time.is_some());
        assert!(task.completion_time.is_some());
    }

    // Drain and observe the clean close.
    write_frame(&mut stream, &key, FrameTag::Disconnect, b"")
        .await
        .unwrap();
    let summary = timeout(Duration::from_secs(10), client)
        .await
        .expect("client should drain")
        .unwrap()
        .unwrap();
    assert_eq!(summary.completed, 4);
    assert_eq!(summary.failed, 0);

    // The client closed its end after the final flush.
    let eof = timeout(Duration::from_secs(5), read_frame(&mut stream, &key))
        .await
        .expect("client should close")
        .unwrap();
    assert!(eof.is_none());
}

#[tokio::test]
async fn test_client_counts_failed_tasks() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = TempDir::new().unwrap();

    let mut settings = test_settings(port, 1);
    settings.client.bundlesize = 1;
    let key = FrameKey::derive(&settings.server.auth);
    let mut context = test_context(&dir, &settings);
    context.template = Template::new("{}");
    let client = tokio::spawn(Client::new(settings, context).run());

    let (mut stream, _hello) = accept_client(&listener, &key).await;
    write_message(&mut stream, &key, FrameTag::BundleOut, &new_bundle(&["true", "false"]))
        .await
        .unwrap();

    let mut returned: Vec<Task> = Vec::new();
    while returned.len() < 2 {
        let frame = timeout(Duration::from_secs(15), read_frame(&mut stream, &key))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if frame.tag == FrameTag::BundleIn {
            returned.extend(frame.decode::<Bundle>().unwrap());
        }
    }
    let statuses: Vec<i64> = returned.iter().map(|t| t.exit_status.unwrap()).collect();
    assert!(statuses.contains(&0));
    assert!(statuses.iter().any(|status| *status != 0));

    write_frame(&mut stream, &key, FrameTag::Disconnect, b"")
        .await
        .unwrap();
    let summary = timeout(Duration::from_secs(10), client)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn test_client_treats_closed_handshake_as_auth_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = TempDir::new().unwrap();

    let settings = test_settings(port, 1);
    let key = FrameKey::derive(&settings.server.auth);
    let context = test_context(&dir, &settings);
    let client = tokio::spawn(Client::new(settings, context).run());

    // Read the hello and slam the door, as the server does on a bad token.
    let (mut stream, _) = listener.accept().await.unwrap();
    let frame = read_frame(&mut stream, &key).await.unwrap().unwrap();
    assert_eq!(frame.tag, FrameTag::Hello);
    drop(stream);

    let error = timeout(Duration::from_secs(10), client)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(shared::exit_code_for(&error), 3);
}

#[tokio::test]
async fn test_client_drains_on_idle_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let dir = TempDir::new().unwrap();

    let mut settings = test_settings(port, 1);
    settings.client.timeout = Some(1);
    let key = FrameKey::derive(&settings.server.auth);
    let context = test_context(&dir, &settings);
    let client = tokio::spawn(Client::new(settings, context).run());

    let (mut stream, _hello) = accept_client(&listener, &key).await;

    // Send nothing: the client gives up after its idle timeout and closes.
    let summary = timeout(Duration::from_secs(10), client)
        .await
        .expect("client should drain on idle")
        .unwrap()
        .unwrap();
    assert_eq!(summary.completed, 0);

    loop {
        match timeout(Duration::from_secs(5), read_frame(&mut stream, &key))
            .await
            .expect("client should close")
            .unwrap()
        {
            Some(frame) => assert_eq!(frame.tag, FrameTag::Heartbeat),
            None => break,
        }
    }
}
