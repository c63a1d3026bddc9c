//! Shared data structures and utilities for the HyperShell execution engine
//!
//! This crate contains the task model, configuration structures, the framed
//! wire protocol and the template engine used by both the server and client
//! components.

pub mod config;
pub mod defaults;
pub mod task;
pub mod template;
pub mod utils;
pub mod wire;

// Re-export commonly used types for convenience
pub use config::Settings;
pub use task::{Bundle, Task, TaskOutcome};
pub use template::Template;
pub use utils::current_timestamp;
pub use wire::{Frame, FrameTag};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the execution engine
///
/// Variants correspond to the failure domains of the system: configuration
/// errors are startup-fatal, auth and transport errors are connection-fatal,
/// template and timeout errors are task-local and must never escape the
/// executor that produced them.
#[derive(Debug, thiserror::Error)]
pub enum HyperShellError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Task timeout: {0}")]
    TaskTimeout(String),

    #[error("Launcher error: {0}")]
    Launcher(String),

    #[error("Interrupted")]
    Interrupted,
}

impl HyperShellError {
    /// Process exit code for this error kind.
    ///
    /// 0 success, 1 uncaught internal, 2 usage, 3 auth, 4 launcher failure,
    /// 5 database failure, 6 interrupted, 7 timeout.
    pub fn exit_code(&self) -> i32 {
        match self {
            HyperShellError::Config(_) => 2,
            HyperShellError::Auth(_) => 3,
            HyperShellError::Launcher(_) => 4,
            HyperShellError::Database(_) => 5,
            HyperShellError::Interrupted => 6,
            HyperShellError::TaskTimeout(_) => 7,
            HyperShellError::Transport(_) => 1,
            HyperShellError::Template(_) => 1,
        }
    }
}

/// Map an arbitrary error chain to a process exit code.
///
/// Walks the chain looking for a `HyperShellError`; anything else is an
/// uncaught internal error (exit code 1).
pub fn exit_code_for(error: &anyhow::Error) -> i32 {
    for cause in error.chain() {
        if let Some(hs) = cause.downcast_ref::<HyperShellError>() {
            return hs.exit_code();
        }
    }
    1
}

#[cfg(test)]
mod tests;
