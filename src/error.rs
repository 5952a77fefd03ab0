//! Error types for AtlasPage
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using AtlasError
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Unified error type for AtlasPage operations
#[derive(Debug, Error)]
pub enum AtlasError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short {op} on page {page}: {done} of {expected} bytes")]
    ShortIo {
        op: &'static str,
        page: u64,
        done: usize,
        expected: usize,
    },

    // -------------------------------------------------------------------------
    // Structural Errors
    // -------------------------------------------------------------------------
    #[error("page {page} corrupted: {reason}")]
    Corruption { page: u64, reason: String },

    /// Index and leaf level disagree, or an operation hit a state that
    /// can only arise from a broken invariant.
    #[error("invariant violated: {0}")]
    Invariant(String),

    // -------------------------------------------------------------------------
    // Log / Recovery Errors
    // -------------------------------------------------------------------------
    #[error("log corruption detected: {0}")]
    LogCorruption(String),

    #[error("recovery failed: {0}")]
    Recovery(String),

    /// A checkpoint failed and durability can no longer be reasoned about.
    #[error("engine halted after checkpoint failure")]
    Halted,

    // -------------------------------------------------------------------------
    // Table Errors
    // -------------------------------------------------------------------------
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    #[error("database directory {0} is in use")]
    DatabaseLocked(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AtlasError {
    pub(crate) fn corruption(page: u64, reason: impl Into<String>) -> Self {
        AtlasError::Corruption {
            page,
            reason: reason.into(),
        }
    }

    pub(crate) fn invariant(reason: impl Into<String>) -> Self {
        AtlasError::Invariant(reason.into())
    }
}
