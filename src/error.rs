//! Error types for the Turnstile service.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate limit key was empty
    #[error("Configuration error: rate limit key must not be empty")]
    InvalidKey,

    /// A permit cost was not positive
    #[error("Configuration error: cost must be positive, got {0}")]
    InvalidCost(u64),

    /// Quota lookup errors
    #[error("Quota error: {0}")]
    Quota(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Whether this error stems from invalid configuration or call arguments.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TurnstileError::Config(_) | TurnstileError::InvalidKey | TurnstileError::InvalidCost(_)
        )
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
