//! Error types for Strata.

use thiserror::Error;

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur in Strata operations.
///
/// Not-found outcomes (missing keys, exhausted iterators) are never errors;
/// they surface as `Ok(None)`.
#[derive(Debug, Error)]
pub enum StrataError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Page store errors
    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: u64 },

    #[error("Page corrupted: {page_id}, reason: {reason}")]
    PageCorrupted { page_id: u64, reason: String },

    #[error("Region exhausted: {0}")]
    RegionExhausted(String),

    #[error("Region not found at page {start}")]
    RegionNotFound { start: u64 },

    #[error("Invalid locator {page_id}:{slot} ({size} bytes): {reason}")]
    InvalidLocator {
        page_id: u64,
        slot: u16,
        size: u16,
        reason: String,
    },

    // Index and page format errors
    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Tuple too large: {size} bytes (page capacity {capacity})")]
    TupleTooLarge { size: usize, capacity: usize },

    #[error("Index node full")]
    NodeFull,

    #[error("Index corrupted: {0}")]
    IndexCorrupted(String),

    #[error("Component build failed earlier, no further writes accepted")]
    BuildFailed,

    // Contract violations
    #[error("Keys must be appended in sorted order: {previous:?} > {next:?}")]
    KeysNotSorted { previous: Vec<u8>, next: Vec<u8> },

    #[error("Component is finalized, writes are done")]
    WritesDone,

    #[error("Component is not finalized yet")]
    NotFinalized,

    #[error("Index tree is finalized")]
    TreeFinalized,

    #[error("Component already deallocated")]
    AlreadyDeallocated,

    #[error("Iterator is closed")]
    IteratorClosed,

    #[error("{0} iterator(s) still open")]
    IteratorsOutstanding(usize),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Returns true for errors caused by a caller breaking the component's
    /// contract. These are never retried or repaired.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            StrataError::KeysNotSorted { .. }
                | StrataError::WritesDone
                | StrataError::NotFinalized
                | StrataError::TreeFinalized
                | StrataError::AlreadyDeallocated
                | StrataError::IteratorClosed
                | StrataError::IteratorsOutstanding(_)
                | StrataError::KeyTooLarge { .. }
                | StrataError::TupleTooLarge { .. }
        )
    }
}
