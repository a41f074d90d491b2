//! Error types for flow node and continuation storage

use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur while persisting or loading run state
#[derive(Error, Debug)]
pub enum StorageError {
    /// Node or unit not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("Binary serialization error: {0}")]
    BinarySerialization(#[from] bincode::Error),

    /// On-disk data failed validation
    #[error("Corrupt data in {unit}: {reason}")]
    Corrupt { unit: String, reason: String },

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Only I/O failures are transient. Anything that failed to encode or
    /// decode will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Storage(_))
    }

    pub(crate) fn corrupt(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            unit: unit.into(),
            reason: reason.into(),
        }
    }
}
