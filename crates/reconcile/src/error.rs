//! Invocation-level errors.

use thiserror::Error;

use settle_core::StoreError;

/// A setup-phase failure that aborts a whole invocation.
///
/// Per-item failures never surface here; they are counted in the job report.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("record store unavailable: {0}")]
    Store(#[from] StoreError),
}
