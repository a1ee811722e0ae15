//! Service Discovery Error Types

use thiserror::Error;

/// Result type alias for serverset operations
pub type Result<T> = std::result::Result<T, Error>;

/// serverset error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Coordination service errors
    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Coordination session expired")]
    SessionExpired,

    #[error("Node does not exist: {0}")]
    NoNode(String),

    // Record errors
    #[error("Malformed record at {path}: {reason}")]
    MalformedRecord { path: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Coordination session closed")]
    Closed,
}

impl Error {
    /// Check if this error is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CoordinationUnavailable(_) | Error::SessionExpired
        )
    }
}
