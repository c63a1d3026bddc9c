//! Task execution
//!
//! One executor runs one shell process at a time. For each task it expands
//! the template against the submitted arguments, projects the task metadata
//! into the environment, spawns `/bin/sh -c` in the configured working
//! directory and waits for exit or timeout. On timeout the process is walked
//! up the escalation ladder: SIGINT, wait `signalwait` seconds, SIGTERM,
//! wait, SIGKILL, wait. A process that survives all three marks the task
//! failed with the timeout status. Template failures never crash the
//! executor; the task is marked failed with the template-error status.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use shared::config::TaskExecConfig;
use shared::task::{Task, EXIT_STATUS_TEMPLATE_ERROR, EXIT_STATUS_TIMEOUT};
use shared::template::Template;
use shared::utils::current_timestamp;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};
use uuid::Uuid;

/// Where spawned processes send their output.
#[derive(Debug, Clone)]
pub enum OutputMode {
    /// Fuse with the client's own stdout/stderr.
    Inherit,
    /// Append all task output to client-wide files.
    Redirect { out: PathBuf, err: PathBuf },
    /// Per-task files under the library directory, recorded on the task.
    Capture,
}

/// Everything an executor needs beyond the task itself.
#[derive(Clone)]
pub struct ExecutorContext {
    pub client_id: Uuid,
    pub client_host: String,
    pub template: Template,
    pub config: TaskExecConfig,
    pub output: OutputMode,
    /// Directory for captured streams in capture mode.
    pub lib_dir: PathBuf,
    /// Operator-configured environment exports.
    pub exports: Vec<(String, String)>,
}

/// Run one task to completion and return it with the outcome recorded.
///
/// A message on `force` short-circuits the wait and escalates immediately;
/// this is how SIGUSR1 shuts executors down.
pub async fn execute_task(
    ctx: &ExecutorContext,
    mut task: Task,
    force: &mut broadcast::Receiver<()>,
) -> Task {
    // A task that arrives already complete (a submit-time template failure)
    // is returned as-is; completed rows are never run again.
    if task.is_complete() {
        debug!(task_id = %task.id, "Task already complete; passing through");
        return task;
    }

    task.client_id = Some(ctx.client_id);
    task.client_host = Some(ctx.client_host.clone());
    task.start_time = Some(current_timestamp());
    task.waited = Some(task.start_time.unwrap() - task.submit_time);

    // The command was fixed at submit time when a submit template was used;
    // otherwise the client template applies here.
    let command = match &task.command {
        Some(command) => command.clone(),
        None => match ctx.template.expand(&task.args).await {
            Ok(command) => command,
            Err(e) => {
                warn!(task_id = %task.id, "Template expansion failed: {}", e);
                task.command = None;
                task.exit_status = Some(EXIT_STATUS_TEMPLATE_ERROR);
                task.completion_time = Some(current_timestamp());
                return task;
            }
        },
    };
    task.command = Some(command.clone());

    let child = match spawn_shell(ctx, &mut task, &command) {
        Ok(child) => child,
        Err(e) => {
            warn!(task_id = %task.id, "Failed to spawn task: {}", e);
            task.exit_status = Some(EXIT_STATUS_TEMPLATE_ERROR);
            task.completion_time = Some(current_timestamp());
            return task;
        }
    };

    let exit_status = await_exit(ctx, &task.id, child, force).await;
    task.exit_status = Some(exit_status);
    task.completion_time = Some(current_timestamp());
    task.duration = Some(task.completion_time.unwrap() - task.start_time.unwrap());
    debug!(
        task_id = %task.id,
        exit_status,
        duration = task.duration.unwrap_or_default(),
        "Task finished"
    );
    task
}

fn spawn_shell(ctx: &ExecutorContext, task: &mut Task, command: &str) -> anyhow::Result<Child> {
    let mut shell = Command::new("/bin/sh");
    shell
        .arg("-c")
        .arg(command)
        .current_dir(&ctx.config.cwd)
        .stdin(Stdio::null());

    match &ctx.output {
        OutputMode::Inherit => {
            shell.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        OutputMode::Redirect { out, err } => {
            let out = std::fs::OpenOptions::new().create(true).append(true).open(out)?;
            let err = std::fs::OpenOptions::new().create(true).append(true).open(err)?;
            shell.stdout(Stdio::from(out)).stderr(Stdio::from(err));
        }
        OutputMode::Capture => {
            std::fs::create_dir_all(&ctx.lib_dir)?;
            let outpath = ctx.lib_dir.join(format!("{}.out", task.id));
            let errpath = ctx.lib_dir.join(format!("{}.err", task.id));
            let out = std::fs::File::create(&outpath)?;
            let err = std::fs::File::create(&errpath)?;
            task.outpath = Some(outpath.to_string_lossy().into_owned());
            task.errpath = Some(errpath.to_string_lossy().into_owned());
            shell.stdout(Stdio::from(out)).stderr(Stdio::from(err));
        }
    }

    for (key, value) in task.environ(&ctx.config.cwd) {
        shell.env(key, value);
    }
    for (key, value) in &ctx.exports {
        shell.env(key, value);
    }

    Ok(shell.spawn()?)
}

/// Wait for the child, honoring the task timeout and the force signal.
async fn await_exit(
    ctx: &ExecutorContext,
    task_id: &Uuid,
    mut child: Child,
    force: &mut broadcast::Receiver<()>,
) -> i64 {
    let limit = ctx.config.timeout.map(Duration::from_secs);

    let escalate_reason = tokio::select! {
        status = child.wait() => {
            return status_code(status);
        }
        _ = force.recv() => "forced shutdown",
        _ = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                // Without a timeout this branch never fires.
                None => std::future::pending::<()>().await,
            }
        } => "timeout",
    };

    warn!(task_id = %task_id, "Task {}; escalating signals", escalate_reason);
    escalate(ctx, child).await
}

/// INT, TERM, KILL, each followed by a `signalwait` grace period.
async fn escalate(ctx: &ExecutorContext, mut child: Child) -> i64 {
    let Some(pid) = child.id() else {
        // Already reaped between the timeout and here.
        return status_code(child.wait().await);
    };
    let pid = Pid::from_raw(pid as i32);
    let grace = Duration::from_secs(ctx.config.signalwait.max(1));

    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGKILL] {
        if let Err(e) = kill(pid, signal) {
            warn!("Failed to signal {} with {:?}: {}", pid, signal, e);
        }
        if let Ok(status) = timeout(grace, child.wait()).await {
            return status_code(status);
        }
    }

    // The process survived SIGKILL; give up on it and mark the task failed.
    warn!("Process {} survived the escalation ladder", pid);
    EXIT_STATUS_TIMEOUT
}

/// Exit code of a finished process: the code when it exited, the negated
/// signal number when it was killed.
fn status_code(status: std::io::Result<std::process::ExitStatus>) -> i64 {
    use std::os::unix::process::ExitStatusExt;
    match status {
        Ok(status) => match status.code() {
            Some(code) => code as i64,
            None => -(status.signal().unwrap_or(0) as i64),
        },
        Err(_) => EXIT_STATUS_TIMEOUT,
    }
}
