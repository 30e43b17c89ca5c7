//! Error types for the lift_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for lift_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller supplied a malformed request (bad target, window, sort mode, cursor)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Requested workout or series document does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Store I/O failure or transaction exhaustion
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error classification exposed to callers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Internal,
}

impl Error {
    /// Classify this error for callers deciding whether to retry
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) | Error::Config(_) | Error::Toml(_) => {
                ErrorKind::InvalidArgument
            }
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Io(_) | Error::Json(_) | Error::Csv(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the whole apply/retract call may be retried
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}
