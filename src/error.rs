//! Error types for memkv
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using MemKvError
pub type Result<T> = std::result::Result<T, MemKvError>;

/// Unified error type for memkv operations
#[derive(Debug, Error)]
pub enum MemKvError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Configuration / Layout Errors
    // -------------------------------------------------------------------------
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Incompatible store layout: {0}")]
    IncompatibleLayout(String),

    #[error("Store corrupted: {0}")]
    Corrupted(String),

    // -------------------------------------------------------------------------
    // Validation Errors
    // -------------------------------------------------------------------------
    #[error("Key must not be empty")]
    EmptyKey,

    #[error("Key too long: {len} bytes (max {max})")]
    KeyTooLong { len: usize, max: usize },

    #[error("Value too long: {len} bytes (max {max})")]
    ValueTooLong { len: usize, max: usize },

    // -------------------------------------------------------------------------
    // Capacity Errors
    // -------------------------------------------------------------------------
    #[error("Store capacity exceeded")]
    CapacityExceeded,

    #[error("Connection limit reached (max {max})")]
    ConnectionLimitExceeded { max: usize },

    // -------------------------------------------------------------------------
    // Lookup Errors
    // -------------------------------------------------------------------------
    #[error("Key not found")]
    KeyNotFound,

    #[error("Buffer too small: need {needed} bytes, have {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Coordination Errors
    // -------------------------------------------------------------------------
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Store in use: {connections} live connection(s)")]
    InUse { connections: usize },
}

impl From<bincode::Error> for MemKvError {
    fn from(e: bincode::Error) -> Self {
        MemKvError::Serialization(e.to_string())
    }
}
