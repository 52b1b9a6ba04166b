//! Common error types for Pierce.

use thiserror::Error;

/// Result type alias using Pierce's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type shared by the tunnel components.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Protocol error (malformed envelope, unexpected message type)
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
