//! Error types for the capture layer.

use crate::codec::FrameError;
use thiserror::Error;

/// Capture-side errors.
#[derive(Error, Debug)]
pub enum CdcError {
    /// I/O error reading the commit-log directory
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame decode error surfaced outside the ParseSkip path
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Source catalog query failed
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Model validation error
    #[error("Model error: {0}")]
    Model(#[from] cassflow_core::ModelError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A downstream queue closed while the reader was still producing
    #[error("Channel closed")]
    ChannelClosed,
}

impl CdcError {
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Result type for capture operations
pub type Result<T> = std::result::Result<T, CdcError>;
