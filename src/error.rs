//! Error types for kube-applier

use thiserror::Error;

/// Main error type for kube-applier operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid process or Waybill configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Git repository operation error
    #[error("git error: {0}")]
    Git(String),

    /// Secret retrieval, content or authorization error
    #[error("{0}")]
    Secret(String),

    /// Apply pipeline error
    #[error("{0}")]
    Apply(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a git error with the given message
    pub fn git(msg: impl Into<String>) -> Self {
        Self::Git(msg.into())
    }

    /// Create a secret error with the given message
    pub fn secret(msg: impl Into<String>) -> Self {
        Self::Secret(msg.into())
    }

    /// Create an apply error with the given message
    pub fn apply(msg: impl Into<String>) -> Self {
        Self::Apply(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}
