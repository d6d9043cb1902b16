//! `settle-core`: identifiers, time and shared errors for the reconciliation
//! workspace.
//!
//! This crate has no IO and no knowledge of the payment provider.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{InvalidId, StoreError, StoreResult};
pub use id::{AuditNoteId, OrderId, RefundId, SideEffectId, WebhookEventId};
