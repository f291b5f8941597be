//! Error types for stem separation

use thiserror::Error;

/// Stem separation error types
#[derive(Error, Debug)]
pub enum SeparationError {
    /// Invalid segment, overlap, shift, weight or budget parameters
    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    /// Repository has no model with this name
    #[error("Model not found: {name}")]
    ModelNotFound { name: String },

    /// Model weights or manifest could not be loaded
    #[error("Failed to load model {name}: {reason}")]
    ModelLoad { name: String, reason: String },

    /// Sample rate, channel layout or source set mismatch
    #[error("Incompatible model: {reason}")]
    IncompatibleModel { reason: String },

    /// Accelerator or host ran out of memory during inference
    #[error("Resources exhausted: {reason}")]
    ResourceExhausted { reason: String },

    /// Separation aborted through a cancellation token
    #[error("Separation cancelled")]
    Cancelled,

    /// Inference failed
    #[error("Inference failed: {reason}")]
    InferenceFailed { reason: String },

    /// Model produced a tensor of the wrong shape
    #[error("Invalid output shape: expected {expected}, got {got}")]
    InvalidOutputShape { expected: String, got: String },

    /// Audio container or codec not supported
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// Sample rate conversion failed
    #[error("Resampling failed: {0}")]
    Resample(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SeparationError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn incompatible(reason: impl Into<String>) -> Self {
        Self::IncompatibleModel {
            reason: reason.into(),
        }
    }

    /// True for out-of-resource failures that a smaller batch may avoid
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }
}

/// Result type for separation operations
pub type SeparationResult<T> = Result<T, SeparationError>;
