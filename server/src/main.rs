//! HyperShell coordination server
//!
//! The server accepts a stream of shell command lines, persists and
//! schedules them across a fleet of clients, and collects completion
//! records. Subcommands: `serve` runs the coordination plane, `submit`
//! inserts tasks without serving, `initdb` prepares the task store, and
//! `cluster` runs server plus an autoscaled local client population in one
//! process.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Server version from Cargo.toml
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use shared::config::Settings;
use shared::task::Bundle;
use shared::template::Template;
use shared::utils::hostname;
use shared::HyperShellError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

mod autoscaler;
mod database;
mod dispatcher;
mod launcher;
mod scheduler;
mod submitter;

use autoscaler::Autoscaler;
use database::TaskStore;
use dispatcher::{Dispatcher, Registrations, ServerCounters};
use launcher::Launcher;
use scheduler::Scheduler;
use submitter::{Submitter, TaskSink};

/// Command-line interface for the server
#[derive(Parser, Debug)]
#[command(name = "hypershell-server", version = SERVER_VERSION)]
#[command(about = "HyperShell coordination server", long_about = None)]
struct Cli {
    /// Explicit configuration file (merged over the standard layers)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordination plane: submitter, scheduler, dispatcher
    Serve(ServeArgs),
    /// Submit tasks into the store without serving
    Submit(SubmitArgs),
    /// Initialize the task store schema
    Initdb,
    /// Run server plus an autoscaled client population
    Cluster(ClusterArgs),
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
    /// Task input file; "-" reads standard input
    #[arg(value_name = "FILE", default_value = "-")]
    input: String,

    /// Run without a task store; bundles flow straight to the queue
    #[arg(long)]
    no_db: bool,

    /// Keep scheduling after the input is exhausted
    #[arg(long)]
    forever: bool,

    /// Revert abandoned tasks from a previous run before scheduling
    #[arg(long)]
    restart: bool,

    /// Do not wait for per-bundle delivery acknowledgment
    #[arg(long)]
    no_confirm: bool,

    /// Append the args of every failed task to this file
    #[arg(long, value_name = "FILE")]
    failures: Option<PathBuf>,

    /// Submit-time template applied to each input line
    #[arg(short = 't', long, value_name = "PATTERN")]
    template: Option<String>,

    /// Override the bind address
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Override the port
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Override the authentication key
    #[arg(long, value_name = "KEY")]
    auth: Option<String>,

    /// Override the outbound queue capacity
    #[arg(long, value_name = "N")]
    queuesize: Option<usize>,

    /// Override the bundle size
    #[arg(short = 'b', long, value_name = "N")]
    bundlesize: Option<usize>,

    /// Maximum attempts per task (values above 1 enable retry)
    #[arg(long, value_name = "N")]
    attempts: Option<u32>,

    /// Prefer retries over novel work when claiming
    #[arg(long)]
    eager: bool,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Task input file; "-" reads standard input
    #[arg(value_name = "FILE", default_value = "-")]
    input: String,

    /// Submit-time template applied to each input line
    #[arg(short = 't', long, value_name = "PATTERN")]
    template: Option<String>,

    /// Attach a key=value tag to every submitted task (repeatable)
    #[arg(long, value_name = "KEY=VALUE")]
    tag: Vec<String>,

    /// Override the submission bundle size
    #[arg(short = 'b', long, value_name = "N")]
    bundlesize: Option<usize>,

    /// Override the submission bundle wait (seconds)
    #[arg(short = 'w', long, value_name = "SEC")]
    bundlewait: Option<u64>,
}

#[derive(Args, Debug)]
struct ClusterArgs {
    #[command(flatten)]
    serve: ServeArgs,

    /// Executors per launched client
    #[arg(short = 'N', long, value_name = "N")]
    num_tasks: Option<usize>,

    /// Autoscaling policy (fixed or dynamic)
    #[arg(long, value_name = "POLICY")]
    autoscale: Option<String>,

    /// Initial client population
    #[arg(long, value_name = "N")]
    init: Option<usize>,

    /// Minimum client population
    #[arg(long, value_name = "N")]
    min: Option<usize>,

    /// Maximum client population
    #[arg(long, value_name = "N")]
    max: Option<usize>,

    /// Pressure factor for the dynamic policy
    #[arg(long, value_name = "F")]
    factor: Option<f64>,

    /// Autoscaler sample period (seconds)
    #[arg(long, value_name = "SEC")]
    period: Option<u64>,

    /// Launcher invocation template (defaults to the bundled client binary)
    #[arg(long, value_name = "CMD")]
    launcher: Option<String>,
}

/// Everything `serve` and `cluster` need beyond the settings record.
struct ServeOptions {
    input: String,
    no_db: bool,
    forever: bool,
    restart: bool,
    failures: Option<PathBuf>,
    template: Option<Template>,
    tags: HashMap<String, String>,
    /// Present when an autoscaled client population should be run.
    launcher: Option<Launcher>,
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("hypershell-server: {:#}", e);
            return shared::exit_code_for(&e);
        }
    };

    let _guard = match init_logging(&settings) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("hypershell-server: {:#}", e);
            return shared::exit_code_for(&e);
        }
    };
    shared::utils::install_panic_hook(std::path::Path::new(&settings.logging.directory));

    let result = match cli.command {
        Command::Serve(args) => {
            let settings = apply_serve_overrides(settings, &args);
            match settings.validate() {
                Ok(()) => {
                    let options = ServeOptions {
                        input: args.input.clone(),
                        no_db: args.no_db,
                        forever: args.forever,
                        restart: args.restart,
                        failures: args.failures.clone(),
                        template: args.template.clone().map(Template::new),
                        tags: HashMap::new(),
                        launcher: None,
                    };
                    run_server(settings, options).await
                }
                Err(e) => Err(e),
            }
        }
        Command::Submit(args) => run_submit(settings, args).await.map(|_| 0),
        Command::Initdb => run_initdb(settings).map(|_| 0),
        Command::Cluster(args) => {
            let mut settings = apply_serve_overrides(settings, &args.serve);
            if let Some(value) = args.num_tasks {
                settings.client.num_tasks = value;
            }
            if let Some(value) = &args.autoscale {
                settings.autoscale.policy = value.clone();
            }
            if let Some(value) = args.init {
                settings.autoscale.size.init = value;
            }
            if let Some(value) = args.min {
                settings.autoscale.size.min = value;
            }
            if let Some(value) = args.max {
                settings.autoscale.size.max = value;
            }
            if let Some(value) = args.factor {
                settings.autoscale.factor = value;
            }
            if let Some(value) = args.period {
                settings.autoscale.period = value;
            }
            match settings.validate() {
                Ok(()) => {
                    let launcher = Launcher::new(args.launcher.clone(), &settings);
                    let options = ServeOptions {
                        input: args.serve.input.clone(),
                        no_db: args.serve.no_db,
                        forever: args.serve.forever,
                        restart: args.serve.restart,
                        failures: args.serve.failures.clone(),
                        template: args.serve.template.clone().map(Template::new),
                        tags: HashMap::new(),
                        launcher: Some(launcher),
                    };
                    run_server(settings, options).await
                }
                Err(e) => Err(e),
            }
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("hypershell-server: {:#}", e);
            shared::exit_code_for(&e)
        }
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    Settings::load(cli.config.as_deref())
}

/// Apply command-line overrides onto the layered settings.
fn apply_serve_overrides(mut settings: Settings, args: &ServeArgs) -> Settings {
    if let Some(value) = &args.bind {
        settings.server.bind = value.clone();
    }
    if let Some(value) = args.port {
        settings.server.port = value;
    }
    if let Some(value) = &args.auth {
        settings.server.auth = value.clone();
    }
    if let Some(value) = args.queuesize {
        settings.server.queuesize = value;
    }
    if let Some(value) = args.bundlesize {
        settings.server.bundlesize = value;
        settings.submit.bundlesize = value;
    }
    if let Some(value) = args.attempts {
        settings.server.attempts = value;
    }
    if args.eager {
        settings.server.eager = true;
    }
    if args.no_confirm {
        settings.server.no_confirm = true;
    }
    settings
}

/// Initialize the rolling-file logging sink.
fn init_logging(
    settings: &Settings,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&settings.logging.directory).with_context(|| {
        format!(
            "Failed to create logging directory: {}",
            settings.logging.directory
        )
    })?;
    let file_appender = tracing_appender::rolling::daily(&settings.logging.directory, "server.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Default directives are only used if RUST_LOG is not set.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "server={level},shared={level}",
            level = settings.logging.level
        ))
    });

    if settings.logging.style == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(non_blocking)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(false)
            .with_writer(non_blocking)
            .init();
    }
    Ok(guard)
}

/// Run the coordination plane until the workload drains or a signal stops
/// it. Returns the process exit code.
async fn run_server(settings: Settings, options: ServeOptions) -> Result<i32> {
    info!(version = SERVER_VERSION, host = %hostname(), "HyperShell server starting");
    let server_id = Uuid::new_v4();

    // Shared plumbing: bounded outbound queue, registration map, counters,
    // drain and shutdown signals. Torn down in reverse order of construction.
    let (queue_tx, queue_rx) = mpsc::channel::<Bundle>(settings.server.queuesize);
    let queue_rx = Arc::new(Mutex::new(queue_rx));
    let registrations: Registrations = Arc::new(Mutex::new(HashMap::new()));
    let counters = Arc::new(ServerCounters::default());
    let (drain_tx, drain_rx) = watch::channel(false);
    let (submitter_done_tx, submitter_done_rx) = watch::channel(false);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let store = if options.no_db {
        None
    } else {
        let path = settings.database.resolved_file();
        let mut store = TaskStore::open(&path)?;
        store.initialize()?;
        info!("Task store ready at {}", path.display());
        Some(Arc::new(Mutex::new(store)))
    };

    // Submitter
    let sink = match &store {
        Some(store) => TaskSink::Store(Arc::clone(store)),
        None => TaskSink::Queue(queue_tx.clone()),
    };
    let submitter = Submitter::new(
        settings.submit.clone(),
        sink,
        options.template.clone(),
        options.tags.clone(),
    );
    let input = Submitter::open_input(&options.input).await?;
    let submitted_total = Arc::new(std::sync::atomic::AtomicI64::new(i64::MAX));
    let submitter_task = {
        let submitted_total = Arc::clone(&submitted_total);
        tokio::spawn(async move {
            let summary = submitter.run(input).await;
            if let Ok(summary) = &summary {
                submitted_total.store(
                    summary.submitted as i64,
                    std::sync::atomic::Ordering::Relaxed,
                );
            }
            let _ = submitter_done_tx.send(true);
            summary
        })
    };

    // Scheduler (db mode) or the no-db drain monitor
    let scheduler_task = match &store {
        Some(store) => {
            let scheduler = Scheduler::new(
                settings.server.clone(),
                Arc::clone(store),
                queue_tx.clone(),
                server_id,
                submitter_done_rx.clone(),
                drain_tx.clone(),
                drain_rx.clone(),
                options.forever,
                shutdown_tx.subscribe(),
            );
            if options.restart {
                let reverted = scheduler.revert_abandoned().await?;
                info!("Restart mode: {} tasks reverted", reverted);
            }
            Some(tokio::spawn(scheduler.run()))
        }
        None => None,
    };

    // Dispatcher
    let dispatcher = Dispatcher::new(
        settings.server.clone(),
        server_id,
        store.clone(),
        Arc::clone(&queue_rx),
        queue_tx.clone(),
        Arc::clone(&registrations),
        options.failures.clone(),
        Arc::clone(&counters),
        drain_rx.clone(),
        shutdown_tx.subscribe(),
    );
    let dispatcher_task = tokio::spawn(dispatcher.run());

    // Autoscaler (cluster mode)
    let autoscaler_task = options.launcher.map(|launcher| {
        let autoscaler = Autoscaler::new(
            settings.autoscale.clone(),
            settings.client.clone(),
            Arc::clone(&registrations),
            store.clone(),
            launcher,
            shutdown_tx.subscribe(),
        );
        tokio::spawn(autoscaler.run())
    });

    // In no-db mode nothing persists: the workload is drained once the
    // submitter has finished and every submitted task has been returned.
    if store.is_none() {
        let monitor_drain = drain_tx.clone();
        let monitor_counters = Arc::clone(&counters);
        let mut monitor_done = submitter_done_rx.clone();
        let monitor_total = Arc::clone(&submitted_total);
        let forever = options.forever;
        let wait = settings.server.wait.max(1);
        tokio::spawn(async move {
            if forever {
                return;
            }
            let _ = monitor_done.wait_for(|done| *done).await;
            loop {
                let (completed, _) = monitor_counters.snapshot();
                if completed >= monitor_total.load(std::sync::atomic::Ordering::Relaxed) {
                    let _ = monitor_drain.send(true);
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_secs(wait)).await;
            }
        });

        let interrupted = wait_for_drain(drain_rx.clone(), drain_tx.clone()).await;
        if interrupted {
            // The submitter may be blocked reading a still-open input.
            submitter_task.abort();
        } else if let Ok(Ok(summary)) = submitter_task.await {
            info!(submitted = summary.submitted, "Submitter finished");
        }
        let _ = dispatcher_task.await;
        if let Some(task) = autoscaler_task {
            task.abort();
        }

        let (completed, failed) = counters.snapshot();
        let submitted = match submitted_total.load(std::sync::atomic::Ordering::Relaxed) {
            i64::MAX => completed,
            value => value,
        };
        info!(submitted, completed, failed, "Server shutdown totals");
        if interrupted && completed < submitted {
            return Err(HyperShellError::Interrupted.into());
        }
        return Ok(if failed > 0 { 1 } else { 0 });
    }

    // db mode: the scheduler drives drain; signals can force it early.
    let interrupted = wait_for_drain(drain_rx.clone(), drain_tx.clone()).await;
    if interrupted {
        submitter_task.abort();
    }

    if let Some(task) = scheduler_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Scheduler failed: {:#}", e);
                let _ = shutdown_tx.send(());
                let _ = dispatcher_task.await;
                return Err(e.context(HyperShellError::Database(
                    "scheduler stopped on persistent database failure".to_string(),
                )));
            }
            Err(e) => return Err(anyhow::anyhow!("scheduler panicked: {}", e)),
        }
    }

    match dispatcher_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(e) => return Err(anyhow::anyhow!("dispatcher panicked: {}", e)),
    }
    if let Some(task) = autoscaler_task {
        task.abort();
    }
    match submitter_task.await {
        Ok(Ok(summary)) => {
            info!(submitted = summary.submitted, "Submitter finished");
        }
        Ok(Err(e)) => warn!("Submitter failed: {:#}", e),
        Err(e) if e.is_cancelled() => {}
        Err(e) => warn!("Submitter panicked: {}", e),
    }

    // Aggregate counts are logged at shutdown; the exit code reflects tasks
    // that stayed failed after every attempt.
    let store = store.expect("db mode");
    let mut store = store.lock().await;
    let (submitted, completed, failed) = store.totals()?;
    let finally_failed = store.count_finally_failed()?;
    info!(
        submitted,
        completed, failed, finally_failed, "Server shutdown totals"
    );
    if interrupted && completed < submitted {
        return Err(HyperShellError::Interrupted.into());
    }
    Ok(if finally_failed > 0 { 1 } else { 0 })
}

/// Wait until drain is signalled, translating SIGINT/SIGTERM into a drain
/// request. Returns true when a signal initiated the drain.
async fn wait_for_drain(mut drain_rx: watch::Receiver<bool>, drain_tx: watch::Sender<bool>) -> bool {
    if *drain_rx.borrow() {
        return false;
    }
    tokio::select! {
        _ = drain_rx.wait_for(|drained| *drained) => false,
        _ = shutdown_signal() => {
            info!("Shutdown signal received; initiating drain");
            let _ = drain_tx.send(true);
            true
        }
    }
}

/// Resolves when SIGTERM or SIGINT arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// `submit`: read tasks and insert them into the store.
async fn run_submit(settings: Settings, args: SubmitArgs) -> Result<()> {
    let mut settings = settings;
    if let Some(value) = args.bundlesize {
        settings.submit.bundlesize = value;
    }
    if let Some(value) = args.bundlewait {
        settings.submit.bundlewait = value;
    }
    settings.validate()?;

    let mut tags = HashMap::new();
    for entry in &args.tag {
        match entry.split_once('=') {
            Some((key, value)) => {
                tags.insert(key.to_string(), value.to_string());
            }
            None => {
                tags.insert(entry.clone(), String::new());
            }
        }
    }

    let path = settings.database.resolved_file();
    let mut store = TaskStore::open(&path)?;
    store.initialize()?;
    let store = Arc::new(Mutex::new(store));

    let submitter = Submitter::new(
        settings.submit.clone(),
        TaskSink::Store(store),
        args.template.map(Template::new),
        tags,
    );
    let input = Submitter::open_input(&args.input).await?;
    let summary = submitter.run(input).await?;
    println!("submitted {} tasks ({} bundles)", summary.submitted, summary.bundles);
    Ok(())
}

/// `initdb`: create the schema explicitly.
fn run_initdb(settings: Settings) -> Result<()> {
    let path = settings.database.resolved_file();
    let mut store = TaskStore::open(&path)?;
    store.initialize()?;
    println!("initialized task store at {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests;
