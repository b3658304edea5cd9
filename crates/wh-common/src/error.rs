//! Error types shared across the warehouse service

use thiserror::Error;

/// Result type alias for warehouse operations
pub type Result<T> = std::result::Result<T, WhError>;

/// Common error type for the warehouse service
#[derive(Error, Debug)]
pub enum WhError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}
