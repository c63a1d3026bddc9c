//! Configuration types and layered loading for the HyperShell engine
//!
//! The settings record enumerates every recognized option. Configuration is
//! assembled from layers, lowest precedence first: compiled defaults, the
//! system file, the user file, the local file, `HYPERSHELL_*` environment
//! variables (with `_` as the section separator) and finally command-line
//! overrides applied by the binaries. Values stored under keys ending in
//! `_env` or `_eval` are late-expanded by the loader, never at use site.

use crate::defaults::*;
use crate::utils::expand_tilde;
use crate::HyperShellError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Every recognized option path, used to project `HYPERSHELL_*` environment
/// variables onto the settings table. `HYPERSHELL_SERVER_PORT` maps to
/// `server.port`, `HYPERSHELL_AUTOSCALE_SIZE_INIT` to `autoscale.size.init`.
const OPTION_PATHS: &[&str] = &[
    "logging.level",
    "logging.style",
    "logging.directory",
    "database.provider",
    "database.file",
    "database.host",
    "database.port",
    "database.user",
    "database.password",
    "database.schema",
    "server.bind",
    "server.port",
    "server.auth",
    "server.queuesize",
    "server.bundlesize",
    "server.attempts",
    "server.eager",
    "server.wait",
    "server.evict",
    "server.no_confirm",
    "client.bundlesize",
    "client.bundlewait",
    "client.heartrate",
    "client.timeout",
    "client.num_tasks",
    "client.capture",
    "client.output",
    "client.errors",
    "submit.bundlesize",
    "submit.bundlewait",
    "task.cwd",
    "task.timeout",
    "task.signalwait",
    "autoscale.policy",
    "autoscale.factor",
    "autoscale.period",
    "autoscale.size.init",
    "autoscale.size.min",
    "autoscale.size.max",
    "ssh.args",
    "ssh.nodelist",
];

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Minimum level emitted (trace, debug, info, warn, error)
    pub level: String,
    /// Output style: "plain" or "json"
    pub style: String,
    /// Directory for rolling log files and traceback dumps
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_logging_level(),
            style: default_logging_style(),
            directory: default_logging_directory(),
        }
    }
}

/// Database backend configuration
///
/// The embedded sqlite provider is compiled in; the server-provider fields
/// (host, port, user, password, schema) describe the interface a server
/// backend would consume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub provider: String,
    pub file: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub schema: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            provider: default_database_provider(),
            file: default_database_file(),
            host: String::new(),
            port: 0,
            user: String::new(),
            password: String::new(),
            schema: default_database_schema(),
        }
    }
}

impl DatabaseConfig {
    /// Resolved filesystem path of the embedded database file.
    pub fn resolved_file(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.file))
    }
}

/// Server-side configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address for the dispatcher
    pub bind: String,
    /// Listen port for the dispatcher
    pub port: u16,
    /// Pre-shared authentication key
    pub auth: String,
    /// Outbound queue capacity in bundles
    pub queuesize: usize,
    /// Number of tasks per scheduled bundle
    pub bundlesize: usize,
    /// Maximum attempts per task; values above 1 enable automatic retry
    pub attempts: u32,
    /// Prefer retries over novel work when claiming
    pub eager: bool,
    /// Scheduler poll and eviction sweep interval (seconds)
    pub wait: u64,
    /// Heartbeat silence before a client is evicted (seconds)
    pub evict: u64,
    /// Do not wait for per-bundle delivery acknowledgment
    pub no_confirm: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            port: default_server_port(),
            auth: default_server_auth(),
            queuesize: default_server_queuesize(),
            bundlesize: default_server_bundlesize(),
            attempts: default_server_attempts(),
            eager: false,
            wait: default_server_wait(),
            evict: default_server_evict(),
            no_confirm: false,
        }
    }
}

impl ServerConfig {
    /// True when the bind address stays on the local machine.
    pub fn is_local_bind(&self) -> bool {
        matches!(self.bind.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

/// Client-side configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Number of finished tasks per return bundle
    pub bundlesize: usize,
    /// Seconds before a partial return bundle is flushed
    pub bundlewait: u64,
    /// Heartbeat interval (seconds)
    pub heartrate: u64,
    /// Idle seconds before the client drains on its own; None disables
    pub timeout: Option<u64>,
    /// Number of concurrent executors
    pub num_tasks: usize,
    /// Capture per-task stdout/stderr under the library directory
    pub capture: bool,
    /// Redirect all task stdout to this file
    pub output: Option<String>,
    /// Redirect all task stderr to this file
    pub errors: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bundlesize: default_client_bundlesize(),
            bundlewait: default_client_bundlewait(),
            heartrate: default_client_heartrate(),
            timeout: None,
            num_tasks: default_client_num_tasks(),
            capture: false,
            output: None,
            errors: None,
        }
    }
}

/// Submission configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SubmitConfig {
    /// Number of buffered tasks per submitted bundle
    pub bundlesize: usize,
    /// Seconds before a partial submission bundle is flushed
    pub bundlewait: u64,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            bundlesize: default_submit_bundlesize(),
            bundlewait: default_submit_bundlewait(),
        }
    }
}

/// Per-task execution configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TaskExecConfig {
    /// Working directory for spawned shell processes
    pub cwd: String,
    /// Wall-clock limit per task (seconds); None disables
    pub timeout: Option<u64>,
    /// Wait between escalation signals (seconds)
    pub signalwait: u64,
}

impl Default for TaskExecConfig {
    fn default() -> Self {
        Self {
            cwd: default_task_cwd(),
            timeout: None,
            signalwait: default_task_signalwait(),
        }
    }
}

/// Autoscaler population bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SizeConfig {
    pub init: usize,
    pub min: usize,
    pub max: usize,
}

impl Default for SizeConfig {
    fn default() -> Self {
        Self {
            init: default_autoscale_init(),
            min: default_autoscale_min(),
            max: default_autoscale_max(),
        }
    }
}

/// Autoscaler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AutoscaleConfig {
    /// "fixed" or "dynamic"
    pub policy: String,
    /// Pressure denominator factor for the dynamic policy
    pub factor: f64,
    /// Sample period (seconds)
    pub period: u64,
    pub size: SizeConfig,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            policy: default_autoscale_policy(),
            factor: default_autoscale_factor(),
            period: default_autoscale_period(),
            size: SizeConfig::default(),
        }
    }
}

/// SSH launcher configuration (interface consumed by the external launcher)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    /// Extra arguments passed through to ssh
    pub args: String,
    /// Remote hosts used round-robin for launched clients
    pub nodelist: Vec<String>,
}

/// The complete settings record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub submit: SubmitConfig,
    pub task: TaskExecConfig,
    pub autoscale: AutoscaleConfig,
    pub ssh: SshConfig,
}

impl Settings {
    /// Load settings from the standard layers plus an optional explicit file.
    ///
    /// Layer order, lowest precedence first: compiled defaults, system file,
    /// user file, local file, explicit file, `HYPERSHELL_*` environment.
    /// Command-line overrides are applied afterwards by the binaries.
    pub fn load(explicit: Option<&Path>) -> crate::Result<Self> {
        let mut table = toml::map::Map::new();

        for path in Self::layer_paths() {
            if path.is_file() {
                merge_file(&mut table, &path)?;
            }
        }
        if let Some(path) = explicit {
            merge_file(&mut table, path)?;
        }

        apply_env_overrides(&mut table);
        expand_deferred(&mut table)?;

        let settings: Settings = toml::Value::Table(table).try_into().map_err(|e| {
            HyperShellError::Config(format!("unrecognized or malformed option: {}", e))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Standard configuration file locations, lowest precedence first.
    pub fn layer_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/hypershell.toml")];
        if let Ok(home) = std::env::var("HOME") {
            paths.push(PathBuf::from(home).join(".hypershell").join("config.toml"));
        }
        paths.push(PathBuf::from(".hypershell").join("config.toml"));
        paths
    }

    /// Library directory for captured task streams.
    pub fn lib_dir(&self) -> PathBuf {
        self.database
            .resolved_file()
            .parent()
            .map(|p| p.join("lib"))
            .unwrap_or_else(|| PathBuf::from(".hypershell/lib"))
    }

    /// Reject configurations that cannot be run.
    pub fn validate(&self) -> crate::Result<()> {
        match self.logging.style.as_str() {
            "plain" | "json" => {}
            other => {
                return Err(HyperShellError::Config(format!(
                    "logging.style must be 'plain' or 'json', got '{}'",
                    other
                ))
                .into())
            }
        }
        match self.database.provider.as_str() {
            "sqlite" => {}
            "postgres" => {
                return Err(HyperShellError::Config(
                    "database.provider 'postgres' is not compiled into this build".to_string(),
                )
                .into())
            }
            other => {
                return Err(HyperShellError::Config(format!(
                    "unknown database.provider '{}'",
                    other
                ))
                .into())
            }
        }
        match self.autoscale.policy.as_str() {
            "fixed" | "dynamic" => {}
            other => {
                return Err(HyperShellError::Config(format!(
                    "autoscale.policy must be 'fixed' or 'dynamic', got '{}'",
                    other
                ))
                .into())
            }
        }
        if self.autoscale.size.min > self.autoscale.size.max {
            return Err(HyperShellError::Config(format!(
                "autoscale.size.min ({}) exceeds autoscale.size.max ({})",
                self.autoscale.size.min, self.autoscale.size.max
            ))
            .into());
        }
        if self.server.bundlesize == 0 || self.submit.bundlesize == 0 {
            return Err(
                HyperShellError::Config("bundlesize must be at least 1".to_string()).into(),
            );
        }
        if self.server.queuesize == 0 {
            return Err(
                HyperShellError::Config("server.queuesize must be at least 1".to_string()).into(),
            );
        }
        if self.client.num_tasks == 0 {
            return Err(
                HyperShellError::Config("client.num_tasks must be at least 1".to_string()).into(),
            );
        }
        // The compiled default key never leaves the local machine.
        if self.server.auth == DEFAULT_AUTHKEY && !self.server.is_local_bind() {
            return Err(HyperShellError::Config(
                "server.auth still holds the compiled default key; set a secret before binding \
                 a non-local address"
                    .to_string(),
            )
            .into());
        }
        Ok(())
    }
}

/// Parse one file and merge its table over the accumulated layers.
fn merge_file(base: &mut toml::map::Map<String, toml::Value>, path: &Path) -> crate::Result<()> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        HyperShellError::Config(format!("cannot read {}: {}", path.display(), e))
    })?;
    let parsed: toml::map::Map<String, toml::Value> = toml::from_str(&content).map_err(|e| {
        HyperShellError::Config(format!("cannot parse {}: {}", path.display(), e))
    })?;
    merge_table(base, parsed);
    Ok(())
}

/// Recursively merge `over` into `base`; tables merge key-wise, everything
/// else replaces.
fn merge_table(
    base: &mut toml::map::Map<String, toml::Value>,
    over: toml::map::Map<String, toml::Value>,
) {
    for (key, value) in over {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_table(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Project `HYPERSHELL_*` environment variables onto the settings table.
fn apply_env_overrides(table: &mut toml::map::Map<String, toml::Value>) {
    for path in OPTION_PATHS {
        let env_key = format!("HYPERSHELL_{}", path.replace('.', "_").to_uppercase());
        if let Ok(raw) = std::env::var(&env_key) {
            insert_path(table, path, parse_scalar(&raw));
        }
    }
}

/// Interpret an environment string as the closest toml scalar.
fn parse_scalar(raw: &str) -> toml::Value {
    if let Ok(v) = raw.parse::<i64>() {
        return toml::Value::Integer(v);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return toml::Value::Float(v);
    }
    match raw {
        "true" => toml::Value::Boolean(true),
        "false" => toml::Value::Boolean(false),
        _ => toml::Value::String(raw.to_string()),
    }
}

/// Insert a value at a dotted path, creating intermediate tables.
fn insert_path(table: &mut toml::map::Map<String, toml::Value>, path: &str, value: toml::Value) {
    let mut parts = path.split('.').peekable();
    let mut current = table;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
        if !entry.is_table() {
            *entry = toml::Value::Table(toml::map::Map::new());
        }
        current = entry.as_table_mut().expect("just ensured table");
    }
}

/// Late-expand `*_env` and `*_eval` keys anywhere in the table.
///
/// `auth_env = "HS_SECRET"` reads the named environment variable into `auth`;
/// `auth_eval = "cat /run/secret"` runs the snippet through `/bin/sh -c` and
/// uses its trimmed stdout.
fn expand_deferred(table: &mut toml::map::Map<String, toml::Value>) -> crate::Result<()> {
    let keys: Vec<String> = table.keys().cloned().collect();
    for key in keys {
        if let Some(toml::Value::Table(_)) = table.get(&key) {
            if let Some(toml::Value::Table(inner)) = table.get_mut(&key) {
                expand_deferred(inner)?;
            }
            continue;
        }
        let (target, expanded) = if let Some(target) = key.strip_suffix("_env") {
            let name = string_value(table, &key)?;
            let value = std::env::var(&name).map_err(|_| {
                HyperShellError::Config(format!(
                    "deferred option '{}' names unset environment variable '{}'",
                    key, name
                ))
            })?;
            (target.to_string(), value)
        } else if let Some(target) = key.strip_suffix("_eval") {
            let snippet = string_value(table, &key)?;
            let output = std::process::Command::new("/bin/sh")
                .arg("-c")
                .arg(&snippet)
                .output()
                .map_err(|e| {
                    HyperShellError::Config(format!("cannot evaluate '{}': {}", key, e))
                })?;
            if !output.status.success() {
                return Err(HyperShellError::Config(format!(
                    "deferred option '{}' exited with {}",
                    key, output.status
                ))
                .into());
            }
            let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
            (target.to_string(), value)
        } else {
            continue;
        };
        if target.is_empty() {
            return Err(HyperShellError::Config(format!(
                "deferred option '{}' has no target key",
                key
            ))
            .into());
        }
        table.remove(&key);
        // Deferred values are credentials and paths; they stay strings.
        table.insert(target, toml::Value::String(expanded));
    }
    Ok(())
}

fn string_value(
    table: &toml::map::Map<String, toml::Value>,
    key: &str,
) -> crate::Result<String> {
    match table.get(key) {
        Some(toml::Value::String(s)) => Ok(s.clone()),
        _ => Err(HyperShellError::Config(format!(
            "deferred option '{}' must hold a string",
            key
        ))
        .into()),
    }
}
