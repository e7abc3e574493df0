//! Unified error types for taplive

use thiserror::Error;

/// Unified error type for all taplive operations
#[derive(Error, Debug)]
pub enum LiveError {
    // Connection errors
    #[error("No credential available for the live channel")]
    MissingCredential,

    #[error("Transport error: {0}")]
    Transport(String),

    // Snapshot errors
    #[error("Fetch failed: {0}")]
    Fetch(String),

    // Event errors
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias using LiveError
pub type Result<T> = std::result::Result<T, LiveError>;
