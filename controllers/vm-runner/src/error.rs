//! Runner error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while supervising the VM.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Invalid environment or configuration document
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A process could not be started
    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// A companion process did not become ready
    #[error("{name} failed: {reason}")]
    Companion { name: String, reason: String },

    /// Waiting for readiness exceeded the start timeout
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Control socket protocol failure
    #[error("QMP error: {0}")]
    Qmp(String),

    /// Guest agent channel failure
    #[error("Agent error: {0}")]
    Agent(String),
}

impl From<serde_json::Error> for RunnerError {
    fn from(err: serde_json::Error) -> Self {
        RunnerError::Qmp(err.to_string())
    }
}
