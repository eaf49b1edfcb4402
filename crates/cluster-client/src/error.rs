//! Cluster client errors

use thiserror::Error;

/// Errors returned by cluster API operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// The object changed since it was read (stale resourceVersion)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Create raced with another writer
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Timeouts, throttling, server errors and transport failures
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("API error {code}: {message}")]
    Api { code: u16, message: String },

    /// The watch resourceVersion is too old, a relist is required
    #[error("Watch expired: {0}")]
    Expired(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ClusterError {
    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::Conflict(_) | ClusterError::AlreadyExists(_) | ClusterError::Transient(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_) | ClusterError::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterError::Conflict(_) => "conflict",
            ClusterError::AlreadyExists(_) => "already_exists",
            ClusterError::NotFound(_) => "not_found",
            ClusterError::Transient(_) => "transient",
            ClusterError::Api { .. } => "api",
            ClusterError::Expired(_) => "expired",
            ClusterError::Serialization(_) => "serialization",
        }
    }

    /// Classify a kube error for the object described by `what`
    pub fn from_kube(err: kube::Error, what: &str) -> Self {
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => ClusterError::NotFound(what.to_string()),
                409 if ae.reason == "AlreadyExists" => ClusterError::AlreadyExists(what.to_string()),
                409 => ClusterError::Conflict(format!("{}: {}", what, ae.message)),
                410 => ClusterError::Expired(ae.message.clone()),
                408 | 429 | 500..=599 => ClusterError::Transient(format!("{}: {}", what, ae.message)),
                code => ClusterError::Api {
                    code,
                    message: format!("{}: {}", what, ae.message),
                },
            },
            kube::Error::SerdeError(e) => ClusterError::Serialization(e.to_string()),
            other => ClusterError::Transient(format!("{}: {}", what, other)),
        }
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}
