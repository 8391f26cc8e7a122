//! Error types for Strata

use crate::{SeriesKey, TimeRange};
use thiserror::Error;

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;

/// Strata error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Payload (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A write disagrees with the data type already recorded for the series
    #[error("Type mismatch on {series}: expected {expected}, got {actual}")]
    TypeMismatch {
        series: String,
        expected: String,
        actual: String,
    },

    /// Read failure scoped to a series and time range
    #[error("Query error on {series} {range}: {reason}")]
    Query {
        series: SeriesKey,
        range: TimeRange,
        reason: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage group not found
    #[error("Storage group not found: {0}")]
    StorageGroupNotFound(String),

    /// WAL recovery error
    #[error("WAL recovery error: {0}")]
    WalRecovery(String),

    /// Compaction error
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// Merge log recovery error
    #[error("Merge recovery error: {0}")]
    MergeRecovery(String),

    /// The engine is shutting down and no longer accepts work
    #[error("Engine is shut down")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, StrataError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StrataError::Corruption(_) | StrataError::ChecksumMismatch { .. }
        )
    }

    /// Attach series and time range context to a read-path failure
    pub fn on_series(self, series: &SeriesKey, range: TimeRange) -> Self {
        match self {
            e @ StrataError::Query { .. } => e,
            other => StrataError::Query {
                series: series.clone(),
                range,
                reason: other.to_string(),
            },
        }
    }
}

impl From<bincode::Error> for StrataError {
    fn from(e: bincode::Error) -> Self {
        StrataError::Serialization(e.to_string())
    }
}
