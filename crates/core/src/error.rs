//! Shared error types.

use thiserror::Error;

/// Result type returned by record stores.
pub type StoreResult<T> = Result<T, StoreError>;

/// Record store failure.
///
/// Stores only report infrastructure problems here; an ineligible record
/// (wrong status, already claimed) is expressed through the return value of
/// the conditional operation, not as an error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn not_found(what: impl core::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Lock poisoning means a writer panicked mid-update.
    pub fn poisoned() -> Self {
        Self::Storage("store lock poisoned".to_string())
    }
}

/// An identifier failed to parse.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {kind}: {reason}")]
pub struct InvalidId {
    pub kind: &'static str,
    pub reason: String,
}
