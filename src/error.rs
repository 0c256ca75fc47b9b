//! Error types for Tether.

use thiserror::Error;

/// Primary error type for all Tether operations.
#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Invalid decision: {0}")]
    InvalidDecision(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl TetherError {
    /// Create an API error.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Whether this error was raised locally, before any network call.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::InvalidDecision(_) | Self::InvalidState(_)
        )
    }
}
