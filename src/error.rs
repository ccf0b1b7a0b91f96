//! Error types for Sentinel.

use thiserror::Error;

/// Main error type for Sentinel operations.
#[derive(Error, Debug)]
pub enum SentinelError {
    /// Malformed rate limit arguments, rejected before any storage access
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Storage lookup miss (absent or expired key)
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The storage backend is closed, down or unreachable
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The caller gave up before the storage call completed
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SentinelError {
    /// Whether this error is a lookup miss the engine may treat as a zero count.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SentinelError::KeyNotFound(_))
    }
}

impl From<config::ConfigError> for SentinelError {
    fn from(err: config::ConfigError) -> Self {
        SentinelError::Config(err.to_string())
    }
}

/// Result type alias for Sentinel operations.
pub type Result<T> = std::result::Result<T, SentinelError>;
