//! `settle-reconcile`: background reconciliation and retry jobs.
//!
//! Four independently scheduled jobs share one bounded, deadline-aware batch
//! executor:
//! - [`WebhookRetryJob`]: orphan recovery and retry of failed webhook events.
//! - [`PaymentSyncJob`]: resolves pending orders from provider payment state.
//! - [`RefundReconcileJob`]: resolves in-flight refunds and flags phantoms.
//! - [`SideEffectRetryJob`]: retries side effects that failed synchronously.

pub mod batch;
pub mod config;
pub mod error;
pub mod handlers;
pub mod job;
pub mod model;
pub mod payments;
pub mod provider;
pub mod refunds;
pub mod side_effects;
pub mod sinks;
pub mod store;
pub mod webhooks;

pub use batch::{BatchExecutor, BatchItem, BatchSummary, Deadline, ItemError, Outcome};
pub use config::{
    BatchLimits, ConfigError, PaymentSyncConfig, ReconcileConfig, RefundReconcileConfig, SideEffectRetryConfig,
    WebhookRetryConfig,
};
pub use error::JobError;
pub use handlers::PaymentWebhookHandlers;
pub use job::ReconcileJob;
pub use model::{
    AuditNote, EventKind, FailedSideEffect, Order, PaymentStatus, Refund, RefundStatus, SideEffectStatus, TaskKind,
    WebhookEvent, WebhookStatus,
};
pub use payments::{PaymentSyncJob, PaymentSyncReport};
pub use provider::{
    InMemoryProvider, IntentStatus, PaymentIntent, PaymentProvider, ProviderError, ProviderEvent, ProviderRefund,
    ProviderRefundStatus, ProviderSnapshot, Throttle, TimeoutProvider,
};
pub use refunds::{RefundReconcileJob, RefundReconcileReport};
pub use side_effects::{SideEffectError, SideEffectRegistry, SideEffectRetryJob, SideEffectRetryReport};
pub use sinks::{AlertSink, InMemoryAlertSink, ReconcileAlert, RecordingStockRestorer, StockRestorer, TracingAlertSink};
pub use store::{
    AuditNoteStore, InMemoryAuditNoteStore, InMemoryOrderStore, InMemoryRefundStore, InMemorySideEffectStore,
    InMemoryWebhookEventStore, OrderStore, RefundStore, SideEffectStore, WebhookEventStore,
};
pub use webhooks::{DispatchError, FollowUpTask, FollowUps, WebhookDispatcher, WebhookRetryJob, WebhookRetryReport};
