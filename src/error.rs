//! RegionDB Error Types

use thiserror::Error;

/// Result type alias for RegionDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// RegionDB error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Database errors. The engine text is surfaced to HTTP callers as-is.
    #[error("{0}")]
    Database(#[from] rusqlite::Error),

    #[error("{0}")]
    Pool(#[from] r2d2::Error),

    // Request errors
    #[error("request body required")]
    EmptyBody,

    #[error("{0}")]
    Body(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Check if this error was caused by the caller's request rather than the node
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::EmptyBody)
    }
}
