//! Error types for the Depot cache and replication engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache and replication subsystems
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error talking to an object store
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller supplied an invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =========================================================================
    // Storage Node Errors
    // =========================================================================
    /// Storage node configuration rejected at load time
    #[error("Invalid configuration for node {node}: {reason}")]
    InvalidNodeConfig { node: String, reason: String },

    /// Object store operation failed
    #[error("Object store {node} failed: {reason}")]
    ObjectStore { node: String, reason: String },

    /// Object not found
    #[error("Not found: {0}")]
    NotFound(String),

    // =========================================================================
    // Replication Errors
    // =========================================================================
    /// Quorum not met for a replicated write
    #[error("insufficient replicas: got {got}, need {need}")]
    InsufficientReplicas { got: usize, need: usize },

    /// Readable replicas disagree on content
    #[error("replica corruption detected for {filename}: checksums disagree ({checksums:?})")]
    ChecksumMismatch {
        filename: String,
        checksums: Vec<String>,
    },

    /// No node is currently healthy
    #[error("No healthy storage nodes available")]
    NoHealthyNodes,

    /// Every healthy node failed to serve a read
    #[error("All healthy nodes failed to read {filename}")]
    AllReadsFailed { filename: String },

    /// Operation exceeded its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an object store error for a given node
    pub fn object_store(node: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::ObjectStore {
            node: node.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error signals data corruption rather than unavailability
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::ChecksumMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_replicas_message() {
        let err = Error::InsufficientReplicas { got: 1, need: 2 };
        assert_eq!(err.to_string(), "insufficient replicas: got 1, need 2");
    }

    #[test]
    fn test_corruption_classification() {
        let err = Error::ChecksumMismatch {
            filename: "a.tgz".to_string(),
            checksums: vec!["aa".into(), "bb".into()],
        };
        assert!(err.is_corruption());
        assert!(!Error::NoHealthyNodes.is_corruption());
    }
}
