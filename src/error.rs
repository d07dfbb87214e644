//! Error types for quotaguard.

use std::time::Duration;
use thiserror::Error;

/// Main error type for quotaguard operations.
#[derive(Error, Debug)]
pub enum QuotaguardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store errors (connection, protocol, script)
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// The shared store did not answer within the configured bound
    #[error("Store did not respond within {0:?}")]
    StoreTimeout(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for QuotaguardError {
    fn from(err: config::ConfigError) -> Self {
        QuotaguardError::Config(err.to_string())
    }
}

/// Result type alias for quotaguard operations.
pub type Result<T> = std::result::Result<T, QuotaguardError>;
