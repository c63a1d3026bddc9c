//! External client launcher
//!
//! The autoscaler delegates launches to an opaque invocation template run
//! through `/bin/sh -c`. With an `ssh.nodelist` configured the invocation is
//! wrapped in ssh and spread round-robin over the listed hosts; otherwise
//! clients are spawned on the local machine. The launcher never terminates
//! clients — attrition happens through the client's own idle timeout.

use anyhow::Result;
use shared::config::{Settings, SshConfig};
use shared::HyperShellError;
use tracing::{debug, info};

pub struct Launcher {
    /// The client invocation, run through the shell.
    command: String,
    ssh: SshConfig,
    /// Environment passed to every launched client so it connects back with
    /// the right coordinates and secret.
    env: Vec<(String, String)>,
    next_node: usize,
    launched: usize,
}

impl Launcher {
    /// Build a launcher from the configured invocation template, or derive
    /// the default invocation of the bundled client binary.
    pub fn new(command: Option<String>, settings: &Settings) -> Self {
        let command = command.unwrap_or_else(|| default_client_invocation(settings));
        let env = vec![
            (
                "HYPERSHELL_SERVER_BIND".to_string(),
                settings.server.bind.clone(),
            ),
            (
                "HYPERSHELL_SERVER_PORT".to_string(),
                settings.server.port.to_string(),
            ),
            (
                "HYPERSHELL_SERVER_AUTH".to_string(),
                settings.server.auth.clone(),
            ),
            (
                "HYPERSHELL_CLIENT_NUM_TASKS".to_string(),
                settings.client.num_tasks.to_string(),
            ),
        ];
        Self {
            command,
            ssh: settings.ssh.clone(),
            env,
            next_node: 0,
            launched: 0,
        }
    }

    /// Start one client. The spawned process is detached; the runtime reaps
    /// it in the background.
    pub fn launch(&mut self) -> Result<()> {
        let invocation = if self.ssh.nodelist.is_empty() {
            self.command.clone()
        } else {
            let node = &self.ssh.nodelist[self.next_node % self.ssh.nodelist.len()];
            self.next_node += 1;
            format!("ssh {} {} '{}'", self.ssh.args, node, self.command)
        };

        debug!("Launching client: {}", invocation);
        let mut command = tokio::process::Command::new("/bin/sh");
        command.arg("-c").arg(&invocation);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
            .stdin(std::process::Stdio::null())
            .spawn()
            .map_err(|e| {
                HyperShellError::Launcher(format!("cannot launch '{}': {}", invocation, e))
            })?;

        self.launched += 1;
        info!("Launched client #{}", self.launched);
        Ok(())
    }
}

/// Default invocation: the hypershell-client binary next to this executable,
/// falling back to PATH lookup.
fn default_client_invocation(settings: &Settings) -> String {
    let binary = std::env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(|dir| dir.join("hypershell-client")))
        .filter(|path| path.exists())
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|| "hypershell-client".to_string());
    format!(
        "{} --host {} --port {} --num-tasks {}",
        binary, settings.server.bind, settings.server.port, settings.client.num_tasks
    )
}
