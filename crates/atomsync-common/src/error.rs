//! Error types for atomsync
//!
//! This module defines the error taxonomy shared by the store, the remote
//! client and the synchronization engine.

use thiserror::Error;

/// Common result type for atomsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for atomsync
#[derive(Debug, Error)]
pub enum Error {
    // Local replica
    #[error("atom not found locally: {kind}:{id}")]
    NotFoundLocally { kind: String, id: String },

    #[error("change set not found: {0}")]
    ChangeSetNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Remote source of truth
    #[error("remote unavailable (status {status}): {message}")]
    RemoteUnavailable { status: u16, message: String },

    #[error("remote rejected request (status {status}): {message}")]
    RemoteRejected { status: u16, message: String },

    // Content
    #[error("malformed patch for {kind}:{id}: {message}")]
    MalformedPatch {
        kind: String,
        id: String,
        message: String,
    },

    #[error("checksum mismatch for {kind}:{id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        kind: String,
        id: String,
        expected: String,
        actual: String,
    },

    // Lifecycle
    #[error("operation cancelled")]
    Cancelled,

    #[error("writer lease lost to {holder}")]
    LeaseLost { holder: String },

    #[error("writer lease held by {holder}")]
    LeaseHeld { holder: String },

    // Internal
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Check if this is a retryable error
    ///
    /// Only a remote that is temporarily unavailable (5xx, timeouts,
    /// connection failures) is worth retrying. Rejections are final until
    /// the next index update.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFoundLocally { .. } | Self::RemoteRejected { .. } | Self::ChangeSetNotFound(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
