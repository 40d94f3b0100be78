//! Error types for model construction and validation.

use thiserror::Error;

/// Errors raised while constructing or validating model types.
#[derive(Error, Debug)]
pub enum ModelError {
    /// Event failed construction-time validation
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Offset failed validation or a monotonicity check
    #[error("Invalid offset: {0}")]
    InvalidOffset(String),

    /// Schema snapshot is malformed
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),
}

impl ModelError {
    pub fn event(msg: impl Into<String>) -> Self {
        Self::InvalidEvent(msg.into())
    }

    pub fn offset(msg: impl Into<String>) -> Self {
        Self::InvalidOffset(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self::InvalidSchema(msg.into())
    }
}

/// Result type for model operations
pub type Result<T> = std::result::Result<T, ModelError>;
