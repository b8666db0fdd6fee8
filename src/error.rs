//! Error types for the captune pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for captune operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (bad hyperparameters, unusable device, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required input file or directory does not exist
    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),

    /// An image file could not be decoded
    #[error("Image decode error for {path}: {reason}")]
    ImageDecode {
        /// Path of the offending image
        path: PathBuf,
        /// Decoder message
        reason: String,
    },

    /// Tokenizer error
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Model loading error
    #[error("Model loading error: {0}")]
    ModelLoading(String),

    /// A saved adapter does not match the base model architecture
    #[error("Architecture mismatch: {0}")]
    ArchitectureMismatch(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for captune operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a tokenizer error
    pub fn tokenizer(msg: impl std::fmt::Display) -> Self {
        Self::Tokenizer(msg.to_string())
    }

    /// Create a model loading error
    pub fn model_loading(msg: impl Into<String>) -> Self {
        Self::ModelLoading(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an architecture mismatch error
    pub fn architecture_mismatch(msg: impl Into<String>) -> Self {
        Self::ArchitectureMismatch(msg.into())
    }
}
