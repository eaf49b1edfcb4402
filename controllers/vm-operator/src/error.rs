//! Controller-specific error types.

use cluster_client::ClusterError;
use kube::Error as KubeError;
use thiserror::Error;

use crate::pool::PoolError;

/// Errors that can occur in the VM operator.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes client setup error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Cluster API call failed
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The VirtualMachine spec cannot be turned into a runner
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Generated object could not be rendered
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl From<serde_json::Error> for ControllerError {
    fn from(err: serde_json::Error) -> Self {
        ControllerError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ControllerError {
    fn from(err: serde_yaml::Error) -> Self {
        ControllerError::Serialization(err.to_string())
    }
}

impl ControllerError {
    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerError::Kube(_) => "kube",
            ControllerError::Cluster(e) => e.kind(),
            ControllerError::InvalidConfig(_) => "invalid_config",
            ControllerError::InvalidSpec(_) => "invalid_spec",
            ControllerError::Pool(_) => "pool",
            ControllerError::Serialization(_) => "serialization",
            ControllerError::Io(_) => "io",
            ControllerError::Watch(_) => "watch",
        }
    }

    /// Optimistic concurrency failure
    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Cluster(e) if e.is_conflict())
    }

    /// Another attempt against fresh state may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ControllerError::Cluster(e) => e.is_transient() || e.is_not_found(),
            ControllerError::Kube(_) | ControllerError::Watch(_) => true,
            _ => false,
        }
    }
}
