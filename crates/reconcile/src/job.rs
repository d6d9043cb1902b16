//! Invocation boundary seen by the external scheduler.

use serde::Serialize;

use crate::error::JobError;

/// One periodically invoked reconciliation job.
///
/// `run` is safe to call again after any failure or truncation: every job
/// re-selects its eligible work from persisted state.
pub trait ReconcileJob {
    type Report: Serialize + core::fmt::Debug;

    fn name(&self) -> &'static str;

    /// Run one invocation. Only setup failures return `Err`.
    fn run(&self) -> Result<Self::Report, JobError>;
}
