//! Utility functions for the HyperShell execution engine
//!
//! Small helpers shared by the server and client components: timestamps,
//! host identification and retry backoff.

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in seconds
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Get current Unix timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Hostname of the running machine, or "localhost" when it cannot be read
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Calculate exponential backoff delay for retries
pub fn calculate_backoff_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let delay = base_delay_ms.saturating_mul(2_u64.pow(attempt.min(10)));
    delay.min(max_delay_ms)
}

/// Format a duration in seconds in human-readable form
pub fn format_seconds(seconds: i64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{:.1}m", seconds as f64 / 60.0)
    } else {
        format!("{:.1}h", seconds as f64 / 3600.0)
    }
}

/// Install a process-wide panic hook that dumps the panic message and a
/// backtrace to a file in the logging directory, then exits with code 1.
/// Uncaught panics in any component must never die silently.
pub fn install_panic_hook(directory: &std::path::Path) {
    let directory = directory.to_path_buf();
    std::panic::set_hook(Box::new(move |info| {
        let path = directory.join(format!("traceback-{}.log", current_timestamp_millis()));
        let backtrace = std::backtrace::Backtrace::force_capture();
        let report = format!("{}\n\n{}\n", info, backtrace);
        if std::fs::write(&path, &report).is_err() {
            eprintln!("{}", report);
        } else {
            eprintln!("fatal: panic recorded at {}", path.display());
        }
        std::process::exit(1);
    }));
}

/// Expand a leading `~` in a path against the HOME environment variable
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home.trim_end_matches('/'), rest);
        }
    }
    path.to_string()
}
