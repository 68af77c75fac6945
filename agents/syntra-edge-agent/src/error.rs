//! Error types for the edge agent core
//!
//! Every fallible operation in the library returns [`AgentError`]. The variants
//! map one-to-one onto the failure kinds callers need to tell apart: a
//! disconnected cloud is recovered from the local backup, a malformed desired
//! document is an authoring error, and request failures always become a
//! structured response.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, AgentError>;

/// Main error type for agent operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    /// The cloud transport is unreachable or the connection was closed
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// The desired-state document failed to parse or validate
    #[error("malformed configuration: {0}")]
    MalformedConfig(String),

    /// No usable local backup exists
    #[error("backup unavailable: {0}")]
    BackupUnavailable(String),

    /// The encryption provider failed to encrypt or decrypt
    #[error("encryption failure: {0}")]
    EncryptionFailure(String),

    /// A request handler did not complete within its budget
    #[error("request timed out after {0:?}")]
    RequestTimeout(std::time::Duration),

    /// No handler is registered for the request name
    #[error("no handler registered for request '{0}'")]
    HandlerNotFound(String),

    /// A request handler returned an error
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// A request payload could not be understood
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Local I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error outside of config decoding
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// Create a disconnected error with the given message
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::Disconnected(msg.into())
    }

    /// Create a malformed configuration error with the given message
    pub fn malformed_config(msg: impl Into<String>) -> Self {
        Self::MalformedConfig(msg.into())
    }

    /// Create a backup unavailable error with the given message
    pub fn backup_unavailable(msg: impl Into<String>) -> Self {
        Self::BackupUnavailable(msg.into())
    }

    /// Create an encryption failure with the given message
    pub fn encryption(msg: impl Into<String>) -> Self {
        Self::EncryptionFailure(msg.into())
    }

    /// Create a handler failure with the given message
    pub fn handler_failure(msg: impl Into<String>) -> Self {
        Self::HandlerFailure(msg.into())
    }

    /// Create an invalid request error with the given message
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// True when the error means the cloud could not be reached
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }

    /// True when the cloud was reached but sent an unusable document
    pub fn is_malformed_config(&self) -> bool {
        matches!(self, Self::MalformedConfig(_))
    }
}
