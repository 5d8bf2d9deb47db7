//! Error types for the trust rotator

use thiserror::Error;

/// Main error type for rotation operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The rotation spec is internally inconsistent
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The trust bundle or a secret payload could not be parsed
    #[error("bundle error: {0}")]
    Bundle(String),

    /// A selected workload cannot be rolled by this operator
    #[error("incompatible workload: {0}")]
    Incompatible(String),

    /// A wait deadline expired
    #[error("timeout: {0}")]
    Timeout(String),

    /// The post-rollout proxy check reported failure
    #[error("verification failed: {0}")]
    Verification(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a bundle error with the given message
    pub fn bundle(msg: impl Into<String>) -> Self {
        Self::Bundle(msg.into())
    }

    /// Create an incompatible-workload error with the given message
    pub fn incompatible(msg: impl Into<String>) -> Self {
        Self::Incompatible(msg.into())
    }

    /// Create a timeout error with the given message
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a verification error with the given message
    pub fn verification(msg: impl Into<String>) -> Self {
        Self::Verification(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}
