//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing configuration files that don't specify certain fields.

/// Compiled-in authentication key. Rejected at startup when the server binds
/// a non-loopback address; only usable for local runs.
pub const DEFAULT_AUTHKEY: &str = "__HYPERSHELL_DEFAULT_AUTHKEY__";

// Logging defaults

/// Default logging level
pub fn default_logging_level() -> String {
    "info".to_string()
}

/// Default logging style (plain or json)
pub fn default_logging_style() -> String {
    "plain".to_string()
}

/// Default logging directory for rolling files and traceback dumps
pub fn default_logging_directory() -> String {
    "./logs".to_string()
}

// Database defaults

/// Default database provider
pub fn default_database_provider() -> String {
    "sqlite".to_string()
}

/// Default database file path (embedded provider)
pub fn default_database_file() -> String {
    "~/.hypershell/task.db".to_string()
}

/// Default database schema name (server providers only)
pub fn default_database_schema() -> String {
    String::new()
}

// Server defaults

/// Default server bind address
pub fn default_server_bind() -> String {
    "localhost".to_string()
}

/// Default server port
pub fn default_server_port() -> u16 {
    50001
}

/// Default pre-shared authentication key
pub fn default_server_auth() -> String {
    DEFAULT_AUTHKEY.to_string()
}

/// Default outbound queue capacity in bundles
pub fn default_server_queuesize() -> usize {
    100
}

/// Default scheduling bundle size in tasks
pub fn default_server_bundlesize() -> usize {
    1
}

/// Default maximum attempts per task (1 means no automatic retry)
pub fn default_server_attempts() -> u32 {
    1
}

/// Default scheduler poll interval (seconds)
pub fn default_server_wait() -> u64 {
    5
}

/// Default heartbeat silence before a client is evicted (seconds)
pub fn default_server_evict() -> u64 {
    600
}

// Client defaults

/// Default return-bundle size in tasks
pub fn default_client_bundlesize() -> usize {
    1
}

/// Default return-bundle wait before a partial flush (seconds)
pub fn default_client_bundlewait() -> u64 {
    5
}

/// Default heartbeat interval (seconds)
pub fn default_client_heartrate() -> u64 {
    10
}

/// Default number of concurrent executors per client
pub fn default_client_num_tasks() -> usize {
    1
}

// Submit defaults

/// Default submission bundle size in tasks
pub fn default_submit_bundlesize() -> usize {
    1
}

/// Default submission wait before a partial flush (seconds)
pub fn default_submit_bundlewait() -> u64 {
    5
}

// Task defaults

/// Default working directory for spawned tasks
pub fn default_task_cwd() -> String {
    ".".to_string()
}

/// Default wait between escalation signals on task timeout (seconds)
pub fn default_task_signalwait() -> u64 {
    10
}

// Autoscale defaults

/// Default autoscaling policy
pub fn default_autoscale_policy() -> String {
    "fixed".to_string()
}

/// Default autoscaling pressure factor
pub fn default_autoscale_factor() -> f64 {
    1.0
}

/// Default autoscaling sample period (seconds)
pub fn default_autoscale_period() -> u64 {
    60
}

/// Default initial client population
pub fn default_autoscale_init() -> usize {
    1
}

/// Default minimum client population
pub fn default_autoscale_min() -> usize {
    0
}

/// Default maximum client population
pub fn default_autoscale_max() -> usize {
    2
}
