//! Persisted record shapes owned by the reconciliation jobs while pending.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use settle_core::{AuditNoteId, OrderId, RefundId, SideEffectId, WebhookEventId};

/// Provider notification kinds the platform knows about.
///
/// Kinds are stored as the provider's dotted names. Anything the platform has
/// no handler for is kept verbatim in [`EventKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    PaymentIntentSucceeded,
    PaymentIntentPaymentFailed,
    PaymentIntentCanceled,
    ChargeRefunded,
    RefundUpdated,
    Other(String),
}

impl EventKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "payment_intent.succeeded" => EventKind::PaymentIntentSucceeded,
            "payment_intent.payment_failed" => EventKind::PaymentIntentPaymentFailed,
            "payment_intent.canceled" => EventKind::PaymentIntentCanceled,
            "charge.refunded" => EventKind::ChargeRefunded,
            "refund.updated" => EventKind::RefundUpdated,
            other => EventKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::PaymentIntentSucceeded => "payment_intent.succeeded",
            EventKind::PaymentIntentPaymentFailed => "payment_intent.payment_failed",
            EventKind::PaymentIntentCanceled => "payment_intent.canceled",
            EventKind::ChargeRefunded => "charge.refunded",
            EventKind::RefundUpdated => "refund.updated",
            EventKind::Other(name) => name,
        }
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        EventKind::parse(&value)
    }
}

impl From<EventKind> for String {
    fn from(value: EventKind) -> Self {
        value.as_str().to_string()
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Webhook processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    /// Claimed by a worker (ingestion or retry); work may be in flight.
    Processing,
    /// Handler applied successfully.
    Completed,
    /// Last attempt failed. Retryable while `attempts < max`.
    Failed,
    /// Can never succeed (unsupported kind, expired upstream).
    Skipped,
}

/// A locally recorded provider notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: WebhookEventId,
    pub external_event_id: String,
    pub event_kind: EventKind,
    pub status: WebhookStatus,
    pub attempts: u32,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl WebhookEvent {
    /// A freshly ingested event, claimed by the ingestion path.
    pub fn received(
        external_event_id: impl Into<String>,
        event_kind: EventKind,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WebhookEventId::new(),
            external_event_id: external_event_id.into(),
            event_kind,
            status: WebhookStatus::Processing,
            attempts: 0,
            received_at,
            processed_at: None,
            error_message: None,
        }
    }

    /// An event whose synchronous processing failed after `attempts` tries.
    pub fn failed(
        external_event_id: impl Into<String>,
        event_kind: EventKind,
        attempts: u32,
        at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: WebhookStatus::Failed,
            attempts,
            processed_at: Some(at),
            error_message: Some(error.into()),
            ..Self::received(external_event_id, event_kind, at)
        }
    }

    /// When the event was last touched: `processed_at`, or `received_at` if never processed.
    pub fn last_touched_at(&self) -> DateTime<Utc> {
        self.processed_at.unwrap_or(self.received_at)
    }

    /// Retry selection predicate.
    pub fn is_retry_eligible(&self, max_attempts: u32, touched_before: DateTime<Utc>) -> bool {
        self.status == WebhookStatus::Failed
            && self.attempts < max_attempts
            && self.last_touched_at() < touched_before
    }

    /// Orphan predicate: claimed but untouched since `touched_before`.
    pub fn is_orphaned(&self, touched_before: DateTime<Utc>) -> bool {
        self.status == WebhookStatus::Processing && self.last_touched_at() < touched_before
    }
}

/// Local payment state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

/// Payment-relevant projection of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub payment_status: PaymentStatus,
    pub external_payment_ref: Option<String>,
    pub customer_email: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn pending(external_payment_ref: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: OrderId::new(),
            payment_status: PaymentStatus::Pending,
            external_payment_ref: Some(external_payment_ref.into()),
            customer_email: None,
            created_at,
        }
    }

    pub fn with_customer_email(mut self, email: impl Into<String>) -> Self {
        self.customer_email = Some(email.into());
        self
    }
}

/// Refund lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundStatus {
    /// Requested, not yet decided.
    Pending,
    /// Decided; submitted upstream once `external_refund_ref` is set.
    Approved,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub id: RefundId,
    pub order_id: OrderId,
    pub status: RefundStatus,
    pub external_refund_ref: Option<String>,
    /// Amount in the smallest currency unit.
    pub amount: i64,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Refund {
    pub fn new(order_id: OrderId, amount: i64, created_at: DateTime<Utc>) -> Self {
        Self {
            id: RefundId::new(),
            order_id,
            status: RefundStatus::Pending,
            external_refund_ref: None,
            amount,
            created_at,
            processed_at: None,
            failure_reason: None,
        }
    }

    /// An approved refund that was submitted upstream at `submitted_at`.
    pub fn submitted(mut self, external_refund_ref: impl Into<String>, submitted_at: DateTime<Utc>) -> Self {
        self.status = RefundStatus::Approved;
        self.external_refund_ref = Some(external_refund_ref.into());
        self.processed_at = Some(submitted_at);
        self
    }

    pub fn with_status(mut self, status: RefundStatus) -> Self {
        self.status = status;
        self
    }

    /// A decision recorded locally that never reached the provider.
    pub fn is_phantom(&self) -> bool {
        matches!(self.status, RefundStatus::Pending | RefundStatus::Approved)
            && self.external_refund_ref.is_none()
    }
}

/// Kinds of side effects that can be retried.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskKind {
    OrderConfirmationEmail,
    PaymentFailedEmail,
    RefundProcessedEmail,
    RefundFailedAlert,
    Other(String),
}

impl TaskKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "order_confirmation_email" => TaskKind::OrderConfirmationEmail,
            "payment_failed_email" => TaskKind::PaymentFailedEmail,
            "refund_processed_email" => TaskKind::RefundProcessedEmail,
            "refund_failed_alert" => TaskKind::RefundFailedAlert,
            other => TaskKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskKind::OrderConfirmationEmail => "order_confirmation_email",
            TaskKind::PaymentFailedEmail => "payment_failed_email",
            TaskKind::RefundProcessedEmail => "refund_processed_email",
            TaskKind::RefundFailedAlert => "refund_failed_alert",
            TaskKind::Other(name) => name,
        }
    }

    /// Every kind the platform ships a handler for.
    pub fn known() -> [TaskKind; 4] {
        [
            TaskKind::OrderConfirmationEmail,
            TaskKind::PaymentFailedEmail,
            TaskKind::RefundProcessedEmail,
            TaskKind::RefundFailedAlert,
        ]
    }
}

impl From<String> for TaskKind {
    fn from(value: String) -> Self {
        TaskKind::parse(&value)
    }
}

impl From<TaskKind> for String {
    fn from(value: TaskKind) -> Self {
        value.as_str().to_string()
    }
}

impl core::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideEffectStatus {
    /// Waiting for a retry.
    Pending,
    /// Recovered; nothing further to do.
    Retried,
    /// Gave up; needs a manual resend.
    Exhausted,
}

/// A side effect that could not complete synchronously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedSideEffect {
    pub id: SideEffectId,
    pub task_kind: TaskKind,
    pub payload: serde_json::Value,
    pub destination: String,
    pub status: SideEffectStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FailedSideEffect {
    pub fn new(
        task_kind: TaskKind,
        payload: serde_json::Value,
        destination: impl Into<String>,
        error: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SideEffectId::new(),
            task_kind,
            payload,
            destination: destination.into(),
            status: SideEffectStatus::Pending,
            attempts: 0,
            last_error: Some(error.into()),
            created_at,
        }
    }
}

/// Human-readable note attached to an order for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditNote {
    pub id: AuditNoteId,
    pub order_id: OrderId,
    pub refund_id: Option<RefundId>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl AuditNote {
    /// Note for a refund decision that never reached the provider.
    pub fn phantom_refund(refund: &Refund, now: DateTime<Utc>) -> Self {
        let age_hours = (now - refund.created_at).num_hours();
        Self {
            id: AuditNoteId::new(),
            order_id: refund.order_id,
            refund_id: Some(refund.id),
            message: format!(
                "Refund {} ({:?}, amount {}) was recorded {}h ago but never submitted to the payment provider. \
                 Verify with the provider and resubmit or cancel it manually.",
                refund.id, refund.status, refund.amount, age_hours
            ),
            created_at: now,
        }
    }
}
