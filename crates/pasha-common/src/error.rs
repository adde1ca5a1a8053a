//! Error types for Pasha.
//!
//! Per-tuple lock failures are not errors: they are folded into transaction
//! abort flags. Only conditions that escape a transaction attempt surface here.

use thiserror::Error;

/// Result type alias using PashaError.
pub type Result<T> = std::result::Result<T, PashaError>;

/// Errors that can occur in Pasha operations.
#[derive(Debug, Error)]
pub enum PashaError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // CXL pool errors
    #[error("CXL pool out of memory: requested {requested} bytes, {available} available")]
    CxlOutOfMemory { requested: u64, available: u64 },

    #[error("CXL arena exhausted: no free slot among {capacity}")]
    CxlArenaExhausted { capacity: usize },

    #[error("Invalid shared handle: {0}")]
    InvalidSharedHandle(u64),

    #[error("Root {index} not published")]
    RootNotPublished { index: usize },

    #[error("Root {index} holds a {actual} structure, expected {expected}")]
    RootTypeMismatch {
        index: usize,
        expected: &'static str,
        actual: &'static str,
    },

    // Migration errors
    #[error("Migration failed for table {table_id} partition {partition_id} key {key}: {reason}")]
    MigrationFailed {
        table_id: u32,
        partition_id: u32,
        key: u64,
        reason: String,
    },

    // Storage errors
    #[error("Table not found: table {table_id} partition {partition_id}")]
    TableNotFound { table_id: u32, partition_id: u32 },

    #[error("Table already exists: table {table_id} partition {partition_id}")]
    TableAlreadyExists { table_id: u32, partition_id: u32 },

    #[error("Value size mismatch: expected {expected}, got {actual}")]
    ValueSizeMismatch { expected: usize, actual: usize },

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Tuple corrupted: {0}")]
    TupleCorrupted(String),

    // WAL errors
    #[error("WAL write failed: {0}")]
    WalWriteFailed(String),

    #[error("WAL corrupted at LSN {lsn}: {reason}")]
    WalCorrupted { lsn: u64, reason: String },

    // Transport errors
    #[error("Transport disconnected: {0}")]
    TransportDisconnected(String),

    #[error("Remote request timed out after {waited_ms} ms with {pending} responses outstanding")]
    RemoteTimeout { waited_ms: u64, pending: usize },

    // Transaction errors
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PashaError {
    /// Returns true if retrying the whole transaction can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PashaError::CxlOutOfMemory { .. }
                | PashaError::CxlArenaExhausted { .. }
                | PashaError::MigrationFailed { .. }
                | PashaError::RemoteTimeout { .. }
                | PashaError::TransactionAborted(_)
        )
    }
}
