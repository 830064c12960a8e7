//! Error types for EcoMap

use thiserror::Error;

/// Result type alias for EcoMap core operations
pub type EcoMapResult<T> = Result<T, EcoMapError>;

/// Main error type for EcoMap core
#[derive(Error, Debug)]
pub enum EcoMapError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid message: {0}")]
    Message(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EcoMapError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new message error
    pub fn message(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }
}
