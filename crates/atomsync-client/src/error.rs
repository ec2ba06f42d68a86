//! Remote client errors

use atomsync_common::Error;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// 5xx response
    #[error("remote unavailable (status {status}): {message}")]
    Unavailable { status: u16, message: String },

    /// No response at all: timeout, refused connection, reset
    #[error("transport error: {0}")]
    Transport(String),

    /// 4xx response, or a status the protocol does not expect
    #[error("remote rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ClientError {
    /// Map a non-success HTTP status to an error
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status >= 500 {
            Self::Unavailable { status, message }
        } else {
            Self::Rejected { status, message }
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Transport(_))
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<ClientError> for Error {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Unavailable { status, message } => {
                Self::RemoteUnavailable { status, message }
            }
            ClientError::Transport(message) => Self::RemoteUnavailable { status: 0, message },
            ClientError::Rejected { status, message } => Self::RemoteRejected { status, message },
            ClientError::Decode(message) => Self::Serialization(message),
            ClientError::Configuration(message) => Self::Configuration(message),
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(ClientError::from_status(503, "down").is_retryable());
        assert!(!ClientError::from_status(404, "missing").is_retryable());
        assert!(ClientError::Transport("timeout".into()).is_retryable());

        let err: Error = ClientError::from_status(502, "bad gateway").into();
        assert!(err.is_retryable());
        let err: Error = ClientError::from_status(400, "not ready").into();
        assert!(err.is_not_found());
    }
}
