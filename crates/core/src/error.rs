//! Error types for the decoder-layer engine

use thiserror::Error;

use crate::tensor::MemorySpace;

/// Result type used across the workspace
pub type Result<T> = std::result::Result<T, LayerError>;

/// Errors raised by the layer engine.
///
/// None of these are retried at this level; a caller that wants retries owns
/// that policy.
#[derive(Debug, Error)]
pub enum LayerError {
    // Input errors, raised before any device work is issued
    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing weight: {0}")]
    MissingWeight(String),

    // Collective errors
    #[error("Synchronization failure in {op}: {reason}")]
    Synchronization { op: &'static str, reason: String },

    // Cache errors
    #[error("Cache entry {name} is corrupt: {reason}")]
    CacheCorruption { name: String, reason: String },

    // Device errors
    #[error(
        "Device {device_id} out of {space} memory: requested {requested} bytes, {available} available"
    )]
    OutOfMemory {
        device_id: usize,
        space: MemorySpace,
        requested: usize,
        available: usize,
    },

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for LayerError {
    fn from(e: toml::de::Error) -> Self {
        LayerError::Toml(e.to_string())
    }
}

impl From<toml::ser::Error> for LayerError {
    fn from(e: toml::ser::Error) -> Self {
        LayerError::Toml(e.to_string())
    }
}

impl LayerError {
    /// Check if this error is retryable
    ///
    /// Partial collective state and corrupt caches are unrecoverable, and
    /// shape/config errors will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Short category name, used in log fields
    pub fn category(&self) -> &'static str {
        match self {
            LayerError::Precondition(_) | LayerError::ShapeMismatch { .. } => "precondition",
            LayerError::Config(_) | LayerError::MissingWeight(_) | LayerError::Toml(_) => {
                "configuration"
            }
            LayerError::Synchronization { .. } => "synchronization",
            LayerError::CacheCorruption { .. } => "cache_corruption",
            LayerError::OutOfMemory { .. } => "out_of_memory",
            LayerError::Io(_) => "io",
        }
    }

    pub fn shape_mismatch(expected: &[usize], got: &[usize]) -> Self {
        LayerError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}
