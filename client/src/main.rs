//! HyperShell worker client
//!
//! A client registers with the coordination server, pulls task bundles,
//! fans tasks out to a bounded pool of executors, and returns completed
//! bundles. It heartbeats while registered and drains on server disconnect,
//! idle timeout or SIGINT.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Client version from Cargo.toml
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

use anyhow::{Context, Result};
use clap::Parser;
use shared::config::Settings;
use shared::task::operator_exports;
use shared::template::Template;
use shared::utils::hostname;
use std::path::PathBuf;
use tracing::{error, info};
use uuid::Uuid;

mod client;
mod executor;

use client::Client;
use executor::{ExecutorContext, OutputMode};

/// Command-line arguments for the client
#[derive(Parser, Debug)]
#[command(name = "hypershell-client", version = CLIENT_VERSION)]
#[command(about = "HyperShell worker client", long_about = None)]
struct CliArgs {
    /// Explicit configuration file (merged over the standard layers)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Server address to connect to
    #[arg(long, value_name = "ADDR")]
    host: Option<String>,

    /// Server port to connect to
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Authentication key
    #[arg(long, value_name = "KEY")]
    auth: Option<String>,

    /// Number of concurrent executors
    #[arg(short = 'N', long, value_name = "N")]
    num_tasks: Option<usize>,

    /// Template applied to task args at execution time
    #[arg(short = 't', long, value_name = "PATTERN")]
    template: Option<String>,

    /// Finished tasks per return bundle
    #[arg(short = 'b', long, value_name = "N")]
    bundlesize: Option<usize>,

    /// Seconds before a partial return bundle is flushed
    #[arg(short = 'w', long, value_name = "SEC")]
    bundlewait: Option<u64>,

    /// Heartbeat interval (seconds)
    #[arg(long, value_name = "SEC")]
    heartrate: Option<u64>,

    /// Idle seconds before the client drains on its own
    #[arg(long, value_name = "SEC")]
    timeout: Option<u64>,

    /// Working directory for task processes
    #[arg(long, value_name = "DIR")]
    cwd: Option<String>,

    /// Wall-clock limit per task (seconds)
    #[arg(long, value_name = "SEC")]
    task_timeout: Option<u64>,

    /// Capture per-task stdout/stderr under the library directory
    #[arg(short = 'c', long)]
    capture: bool,

    /// Redirect all task stdout to this file
    #[arg(short = 'o', long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Redirect all task stderr to this file
    #[arg(short = 'e', long, value_name = "FILE")]
    errors: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let args = CliArgs::parse();

    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("hypershell-client: {:#}", e);
            return shared::exit_code_for(&e);
        }
    };

    let _guard = match init_logging(&settings) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("hypershell-client: {:#}", e);
            return shared::exit_code_for(&e);
        }
    };
    shared::utils::install_panic_hook(std::path::Path::new(&settings.logging.directory));

    info!(version = CLIENT_VERSION, host = %hostname(), "HyperShell client starting");

    let output = if args.capture || settings.client.capture {
        OutputMode::Capture
    } else {
        let out = args
            .output
            .or_else(|| settings.client.output.clone().map(PathBuf::from));
        let err = args
            .errors
            .or_else(|| settings.client.errors.clone().map(PathBuf::from));
        match (out, err) {
            (None, None) => OutputMode::Inherit,
            (out, err) => {
                let fallback = PathBuf::from("/dev/null");
                OutputMode::Redirect {
                    out: out.unwrap_or_else(|| fallback.clone()),
                    err: err.unwrap_or(fallback),
                }
            }
        }
    };

    let context = ExecutorContext {
        client_id: Uuid::new_v4(),
        client_host: hostname(),
        template: args
            .template
            .clone()
            .map(Template::new)
            .unwrap_or_else(Template::identity),
        config: settings.task.clone(),
        output,
        lib_dir: settings.lib_dir(),
        exports: operator_exports(),
    };

    match Client::new(settings, context).run().await {
        Ok(summary) => {
            info!(
                completed = summary.completed,
                failed = summary.failed,
                "Client exiting"
            );
            0
        }
        Err(e) => {
            error!("{:#}", e);
            eprintln!("hypershell-client: {:#}", e);
            shared::exit_code_for(&e)
        }
    }
}

/// Load the layered settings and fold in command-line overrides.
fn load_settings(args: &CliArgs) -> Result<Settings> {
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(value) = &args.host {
        settings.server.bind = value.clone();
    }
    if let Some(value) = args.port {
        settings.server.port = value;
    }
    if let Some(value) = &args.auth {
        settings.server.auth = value.clone();
    }
    if let Some(value) = args.num_tasks {
        settings.client.num_tasks = value;
    }
    if let Some(value) = args.bundlesize {
        settings.client.bundlesize = value;
    }
    if let Some(value) = args.bundlewait {
        settings.client.bundlewait = value;
    }
    if let Some(value) = args.heartrate {
        settings.client.heartrate = value;
    }
    if let Some(value) = args.timeout {
        settings.client.timeout = Some(value);
    }
    if let Some(value) = &args.cwd {
        settings.task.cwd = value.clone();
    }
    if let Some(value) = args.task_timeout {
        settings.task.timeout = Some(value);
    }
    settings.validate()?;
    Ok(settings)
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
    let file_appender = tracing_appender::rolling::daily(&settings.logging.directory, "client.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "client={level},shared={level}",
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

#[cfg(test)]
mod tests;
