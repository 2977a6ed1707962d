//! Error types for the capture agent.
//!
//! The primary error type is `AgentError`. Per-file failures inside a scan
//! or a verification pass are never represented here; they are logged and
//! recorded as data (issues, kept tasks) so one bad file cannot stop a pass.

use std::io;
use std::path::PathBuf;

/// Errors surfaced by agent services.
///
/// Service methods fail soft by default: most callers log a transient error
/// and move on. The exceptions are session ending and deletion-task
/// completion, which propagate errors so the caller knows the remote side
/// has not recorded the outcome.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Failed to read a file or its metadata
    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write a file
    #[error("failed to write {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to enumerate a directory
    #[error("failed to enumerate {path}")]
    Enumeration {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The local state file could not be read or written
    #[error("local store unavailable at {path}")]
    Store {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The local state file could not be serialized
    #[error("local store serialization failed")]
    StoreFormat(#[source] serde_json::Error),

    /// No HTTP response was received (connectivity loss, timeout)
    #[error("network failure during {operation}: {message}")]
    Network { operation: String, message: String },

    /// The remote API answered with a non-success status
    #[error("api rejected {operation} with status {status}: {message}")]
    Api {
        operation: String,
        status: u16,
        message: String,
    },

    /// The remote API answered but the body was not what we expected
    #[error("unexpected response for {operation}: {message}")]
    Response { operation: String, message: String },

    /// Device or token identity conflict; never retried
    #[error("identity error: {0}")]
    Identity(String),

    /// No active session exists for the given volume
    #[error("no active session for volume {hardware_id}")]
    SessionNotFound { hardware_id: String },

    /// An exclusive pass (scan, verify) is already running
    #[error("a {operation} pass is already running")]
    Busy { operation: &'static str },

    /// Invalid or unloadable configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl AgentError {
    /// Convenience constructor for network-level failures.
    pub fn network(operation: impl Into<String>, message: impl Into<String>) -> Self {
        AgentError::Network {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// True for failures that are expected to clear on their own
    /// (connectivity loss). Transient failures flip the gateway offline and
    /// are queued or retried; they are never surfaced as hard failures to
    /// the copy workflow.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Network { .. })
    }
}
