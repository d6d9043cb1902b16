//! Read-only boundary to the external payment provider.
//!
//! Nothing in this subsystem mutates provider state; jobs only poll it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use settle_core::Clock;

use crate::model::EventKind;

/// Provider call failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The record does not exist upstream (never created, or expired).
    #[error("not found upstream: {0}")]
    NotFound(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider rate limit hit")]
    RateLimited,

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider error: {0}")]
    Api(String),
}

impl ProviderError {
    /// Permanent errors will not go away by retrying.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

/// Canonical event as the provider currently reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    pub kind: EventKind,
    /// Id of the provider object the event is about (intent, charge, refund).
    pub object_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ProviderEvent {
    pub fn new(id: impl Into<String>, kind: EventKind, object_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            object_id: object_id.into(),
            data: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// String field of the event's data object.
    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(|v| v.as_str())
    }
}

/// Payment intent status as reported upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IntentStatus {
    Succeeded,
    Canceled,
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    RequiresCapture,
    Processing,
    Other(String),
}

impl IntentStatus {
    pub fn parse(name: &str) -> Self {
        match name {
            "succeeded" => IntentStatus::Succeeded,
            "canceled" => IntentStatus::Canceled,
            "requires_payment_method" => IntentStatus::RequiresPaymentMethod,
            "requires_confirmation" => IntentStatus::RequiresConfirmation,
            "requires_action" => IntentStatus::RequiresAction,
            "requires_capture" => IntentStatus::RequiresCapture,
            "processing" => IntentStatus::Processing,
            other => IntentStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            IntentStatus::Succeeded => "succeeded",
            IntentStatus::Canceled => "canceled",
            IntentStatus::RequiresPaymentMethod => "requires_payment_method",
            IntentStatus::RequiresConfirmation => "requires_confirmation",
            IntentStatus::RequiresAction => "requires_action",
            IntentStatus::RequiresCapture => "requires_capture",
            IntentStatus::Processing => "processing",
            IntentStatus::Other(name) => name,
        }
    }

    /// The payment will not complete without a new payment attempt.
    pub fn is_failed(&self) -> bool {
        matches!(self, IntentStatus::Canceled | IntentStatus::RequiresPaymentMethod)
    }
}

impl From<String> for IntentStatus {
    fn from(value: String) -> Self {
        IntentStatus::parse(&value)
    }
}

impl From<IntentStatus> for String {
    fn from(value: IntentStatus) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: IntentStatus,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PaymentIntent {
    pub fn new(id: impl Into<String>, status: IntentStatus) -> Self {
        Self {
            id: id.into(),
            status,
            last_error: None,
        }
    }
}

/// Refund status as reported upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProviderRefundStatus {
    Succeeded,
    Failed,
    Canceled,
    Pending,
    RequiresAction,
    Other(String),
}

impl ProviderRefundStatus {
    pub fn parse(name: &str) -> Self {
        match name {
            "succeeded" => ProviderRefundStatus::Succeeded,
            "failed" => ProviderRefundStatus::Failed,
            "canceled" => ProviderRefundStatus::Canceled,
            "pending" => ProviderRefundStatus::Pending,
            "requires_action" => ProviderRefundStatus::RequiresAction,
            other => ProviderRefundStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ProviderRefundStatus::Succeeded => "succeeded",
            ProviderRefundStatus::Failed => "failed",
            ProviderRefundStatus::Canceled => "canceled",
            ProviderRefundStatus::Pending => "pending",
            ProviderRefundStatus::RequiresAction => "requires_action",
            ProviderRefundStatus::Other(name) => name,
        }
    }
}

impl From<String> for ProviderRefundStatus {
    fn from(value: String) -> Self {
        ProviderRefundStatus::parse(&value)
    }
}

impl From<ProviderRefundStatus> for String {
    fn from(value: ProviderRefundStatus) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRefund {
    pub id: String,
    pub status: ProviderRefundStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl ProviderRefund {
    pub fn new(id: impl Into<String>, status: ProviderRefundStatus) -> Self {
        Self {
            id: id.into(),
            status,
            failure_reason: None,
        }
    }

    pub fn with_failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }
}

/// Read-only provider client.
pub trait PaymentProvider: Send + Sync {
    fn retrieve_event(&self, id: &str) -> Result<ProviderEvent, ProviderError>;

    fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, ProviderError>;

    fn retrieve_refund(&self, id: &str) -> Result<ProviderRefund, ProviderError>;
}

/// Enforces a per-call timeout on any provider.
///
/// Each call runs on a helper thread; if it does not answer within `timeout`
/// the caller gets [`ProviderError::Timeout`] and the helper is abandoned.
#[derive(Clone)]
pub struct TimeoutProvider {
    inner: Arc<dyn PaymentProvider>,
    timeout: Duration,
}

impl TimeoutProvider {
    pub fn new(inner: Arc<dyn PaymentProvider>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    fn call<T, F>(&self, op: &'static str, f: F) -> Result<T, ProviderError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn PaymentProvider) -> Result<T, ProviderError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let inner = self.inner.clone();

        thread::Builder::new()
            .name(format!("provider-{op}"))
            .spawn(move || {
                let _ = tx.send(f(inner.as_ref()));
            })
            .map_err(|e| ProviderError::Unavailable(format!("cannot spawn provider call: {e}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(op, timeout = ?self.timeout, "provider call timed out");
                Err(ProviderError::Timeout(self.timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ProviderError::Unavailable(format!(
                "provider call {op} aborted"
            ))),
        }
    }
}

impl PaymentProvider for TimeoutProvider {
    fn retrieve_event(&self, id: &str) -> Result<ProviderEvent, ProviderError> {
        let id = id.to_string();
        self.call("retrieve_event", move |p| p.retrieve_event(&id))
    }

    fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, ProviderError> {
        let id = id.to_string();
        self.call("retrieve_payment_intent", move |p| p.retrieve_payment_intent(&id))
    }

    fn retrieve_refund(&self, id: &str) -> Result<ProviderRefund, ProviderError> {
        let id = id.to_string();
        self.call("retrieve_refund", move |p| p.retrieve_refund(&id))
    }
}

/// Spaces out provider calls within one batch.
///
/// The first call goes out immediately; every later call waits `delay`.
pub struct Throttle {
    clock: Arc<dyn Clock>,
    delay: Duration,
    calls: u64,
}

impl Throttle {
    pub fn new(clock: Arc<dyn Clock>, delay: Duration) -> Self {
        Self {
            clock,
            delay,
            calls: 0,
        }
    }

    /// Call immediately before each provider request.
    pub fn wait(&mut self) {
        if self.calls > 0 && !self.delay.is_zero() {
            self.clock.sleep(self.delay);
        }
        self.calls += 1;
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

/// Serializable provider state for dry runs and replays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    #[serde(default)]
    pub events: Vec<ProviderEvent>,
    #[serde(default)]
    pub payment_intents: Vec<PaymentIntent>,
    #[serde(default)]
    pub refunds: Vec<ProviderRefund>,
}

/// Call counters of an [`InMemoryProvider`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProviderCalls {
    pub events: usize,
    pub payment_intents: usize,
    pub refunds: usize,
}

impl ProviderCalls {
    pub fn total(&self) -> usize {
        self.events + self.payment_intents + self.refunds
    }
}

/// In-memory provider for tests/dev.
///
/// Unknown ids answer [`ProviderError::NotFound`]; injected failures take
/// precedence over stored records.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    events: RwLock<HashMap<String, ProviderEvent>>,
    intents: RwLock<HashMap<String, PaymentIntent>>,
    refunds: RwLock<HashMap<String, ProviderRefund>>,
    failures: RwLock<HashMap<String, ProviderError>>,
    event_calls: AtomicUsize,
    intent_calls: AtomicUsize,
    refund_calls: AtomicUsize,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn from_snapshot(snapshot: ProviderSnapshot) -> Self {
        let provider = Self::new();
        for event in snapshot.events {
            provider.put_event(event);
        }
        for intent in snapshot.payment_intents {
            provider.put_intent(intent);
        }
        for refund in snapshot.refunds {
            provider.put_refund(refund);
        }
        provider
    }

    pub fn snapshot(&self) -> ProviderSnapshot {
        let mut snapshot = ProviderSnapshot {
            events: read(&self.events).values().cloned().collect(),
            payment_intents: read(&self.intents).values().cloned().collect(),
            refunds: read(&self.refunds).values().cloned().collect(),
        };
        snapshot.events.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot.payment_intents.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot.refunds.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
    }

    pub fn put_event(&self, event: ProviderEvent) {
        write(&self.events).insert(event.id.clone(), event);
    }

    pub fn put_intent(&self, intent: PaymentIntent) {
        write(&self.intents).insert(intent.id.clone(), intent);
    }

    pub fn put_refund(&self, refund: ProviderRefund) {
        write(&self.refunds).insert(refund.id.clone(), refund);
    }

    /// Make every call for `id` fail with `error`.
    pub fn fail(&self, id: impl Into<String>, error: ProviderError) {
        write(&self.failures).insert(id.into(), error);
    }

    pub fn calls(&self) -> ProviderCalls {
        ProviderCalls {
            events: self.event_calls.load(Ordering::SeqCst),
            payment_intents: self.intent_calls.load(Ordering::SeqCst),
            refunds: self.refund_calls.load(Ordering::SeqCst),
        }
    }

    fn lookup<T: Clone>(&self, map: &RwLock<HashMap<String, T>>, id: &str) -> Result<T, ProviderError> {
        if let Some(err) = read(&self.failures).get(id) {
            return Err(err.clone());
        }
        read(map)
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }
}

impl PaymentProvider for InMemoryProvider {
    fn retrieve_event(&self, id: &str) -> Result<ProviderEvent, ProviderError> {
        self.event_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup(&self.events, id)
    }

    fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, ProviderError> {
        self.intent_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup(&self.intents, id)
    }

    fn retrieve_refund(&self, id: &str) -> Result<ProviderRefund, ProviderError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup(&self.refunds, id)
    }
}

// The provider maps hold plain values, so a poisoned lock still holds consistent data.
fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use settle_core::ManualClock;

    struct SlowProvider;

    impl PaymentProvider for SlowProvider {
        fn retrieve_event(&self, id: &str) -> Result<ProviderEvent, ProviderError> {
            thread::sleep(Duration::from_millis(500));
            Err(ProviderError::NotFound(id.to_string()))
        }

        fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, ProviderError> {
            Ok(PaymentIntent::new(id, IntentStatus::Processing))
        }

        fn retrieve_refund(&self, id: &str) -> Result<ProviderRefund, ProviderError> {
            Err(ProviderError::NotFound(id.to_string()))
        }
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let provider = InMemoryProvider::new();
        let err = provider.retrieve_refund("re_missing").unwrap_err();
        assert_eq!(err, ProviderError::NotFound("re_missing".to_string()));
        assert!(err.is_permanent());
        assert_eq!(provider.calls().refunds, 1);
    }

    #[test]
    fn injected_failures_win() {
        let provider = InMemoryProvider::new();
        provider.put_intent(PaymentIntent::new("pi_1", IntentStatus::Succeeded));
        provider.fail("pi_1", ProviderError::RateLimited);

        let err = provider.retrieve_payment_intent("pi_1").unwrap_err();
        assert_eq!(err, ProviderError::RateLimited);
        assert!(!err.is_permanent());
    }

    #[test]
    fn timeout_provider_cuts_off_slow_calls() {
        let provider = TimeoutProvider::new(Arc::new(SlowProvider), Duration::from_millis(50));

        let err = provider.retrieve_event("evt_1").unwrap_err();
        assert_eq!(err, ProviderError::Timeout(Duration::from_millis(50)));

        let intent = provider.retrieve_payment_intent("pi_1").unwrap();
        assert_eq!(intent.status, IntentStatus::Processing);
    }

    #[test]
    fn throttle_skips_the_first_call() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let mut throttle = Throttle::new(clock.clone(), Duration::from_millis(200));

        throttle.wait();
        assert_eq!(clock.now(), start);

        throttle.wait();
        throttle.wait();
        assert_eq!(clock.now() - start, chrono::Duration::milliseconds(400));
        assert_eq!(throttle.calls(), 3);
    }

    #[test]
    fn snapshot_round_trip_preserves_records() {
        let provider = InMemoryProvider::new();
        provider.put_intent(PaymentIntent::new("pi_1", IntentStatus::Canceled));
        provider.put_refund(
            ProviderRefund::new("re_1", ProviderRefundStatus::Failed).with_failure_reason("expired_card"),
        );

        let restored = InMemoryProvider::from_snapshot(provider.snapshot());
        assert_eq!(
            restored.retrieve_payment_intent("pi_1").unwrap().status,
            IntentStatus::Canceled
        );
        assert_eq!(
            restored.retrieve_refund("re_1").unwrap().failure_reason.as_deref(),
            Some("expired_card")
        );
    }
}
