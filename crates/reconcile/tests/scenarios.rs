use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use proptest::prelude::*;

use settle_core::{Clock, ManualClock, OrderId, StoreResult};
use settle_reconcile::{
    AuditNoteStore, BatchLimits, EventKind, FailedSideEffect, FollowUps, InMemoryAlertSink, InMemoryAuditNoteStore,
    InMemoryOrderStore, InMemoryProvider, InMemoryRefundStore, InMemorySideEffectStore, InMemoryWebhookEventStore,
    IntentStatus, Order, OrderStore, PaymentIntent, PaymentStatus, PaymentSyncConfig, PaymentSyncJob,
    PaymentWebhookHandlers, ProviderEvent, ProviderRefund, ProviderRefundStatus, ReconcileJob, RecordingStockRestorer,
    Refund, RefundReconcileConfig, RefundReconcileJob, RefundStatus, RefundStore, SideEffectRegistry,
    SideEffectRetryConfig, SideEffectRetryJob, SideEffectStatus, SideEffectStore, TaskKind, WebhookDispatcher,
    WebhookEvent, WebhookEventStore, WebhookRetryConfig, WebhookRetryJob, WebhookStatus,
};

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc::now()))
}

struct Shop {
    clock: Arc<ManualClock>,
    events: Arc<InMemoryWebhookEventStore>,
    orders: Arc<InMemoryOrderStore>,
    refunds: Arc<InMemoryRefundStore>,
    queue: Arc<InMemorySideEffectStore>,
    notes: Arc<InMemoryAuditNoteStore>,
    provider: Arc<InMemoryProvider>,
    stock: Arc<RecordingStockRestorer>,
    alerts: Arc<InMemoryAlertSink>,
}

impl Shop {
    fn new() -> Self {
        Self::with_stock(RecordingStockRestorer::new())
    }

    fn with_stock(stock: RecordingStockRestorer) -> Self {
        Self {
            clock: clock(),
            events: InMemoryWebhookEventStore::arc(),
            orders: InMemoryOrderStore::arc(),
            refunds: InMemoryRefundStore::arc(),
            queue: InMemorySideEffectStore::arc(),
            notes: InMemoryAuditNoteStore::arc(),
            provider: InMemoryProvider::arc(),
            stock: Arc::new(stock),
            alerts: Arc::new(InMemoryAlertSink::new()),
        }
    }

    fn handlers(&self) -> PaymentWebhookHandlers {
        PaymentWebhookHandlers::new(
            self.orders.clone(),
            self.refunds.clone(),
            self.stock.clone(),
            self.clock.clone(),
        )
    }

    fn webhook_job(&self, config: WebhookRetryConfig) -> WebhookRetryJob {
        WebhookRetryJob::new(
            self.events.clone(),
            self.provider.clone(),
            Arc::new(self.handlers()),
            FollowUps::new(Arc::new(SideEffectRegistry::new()), self.queue.clone()),
            config,
            BatchLimits::default(),
            self.clock.clone(),
        )
    }

    fn payment_job(&self) -> PaymentSyncJob {
        PaymentSyncJob::new(
            self.orders.clone(),
            self.provider.clone(),
            self.stock.clone(),
            self.alerts.clone(),
            PaymentSyncConfig::default(),
            BatchLimits::default(),
            self.clock.clone(),
        )
    }

    fn refund_job(&self) -> RefundReconcileJob {
        RefundReconcileJob::new(
            self.refunds.clone(),
            self.notes.clone(),
            self.provider.clone(),
            self.alerts.clone(),
            RefundReconcileConfig::default(),
            BatchLimits::default(),
            self.clock.clone(),
        )
    }

    fn ago(&self, age: ChronoDuration) -> DateTime<Utc> {
        self.clock.now() - age
    }

    /// A `FAILED` payment-succeeded event for a fresh pending order.
    fn failed_payment_event(&self, n: usize, attempts: u32) -> (WebhookEvent, Order) {
        let payment_ref = format!("pi_{n}");
        let order = Order::pending(&payment_ref, self.ago(ChronoDuration::minutes(30)));
        self.orders.insert(order.clone()).unwrap();

        let ext = format!("evt_{n}");
        let mut event = WebhookEvent::failed(
            &ext,
            EventKind::PaymentIntentSucceeded,
            attempts,
            self.ago(ChronoDuration::minutes(10)),
            "database timeout",
        );
        // Keep arrival order stable.
        event.received_at = self.ago(ChronoDuration::minutes(60 - n as i64));
        self.events.insert(event.clone()).unwrap();
        self.provider
            .put_event(ProviderEvent::new(ext, EventKind::PaymentIntentSucceeded, payment_ref));
        (event, order)
    }
}

#[test]
fn failed_events_are_completed_in_one_run() {
    let shop = Shop::new();
    let seeded: Vec<_> = [0, 1, 2]
        .into_iter()
        .enumerate()
        .map(|(n, attempts)| shop.failed_payment_event(n, attempts))
        .collect();

    let report = shop.webhook_job(WebhookRetryConfig::default()).run().unwrap();

    assert_eq!(report.found, 3);
    assert_eq!(report.succeeded, 3);
    let attempts: Vec<_> = seeded
        .iter()
        .map(|(event, _)| {
            let stored = shop.events.get(event.id).unwrap().unwrap();
            assert_eq!(stored.status, WebhookStatus::Completed);
            assert_eq!(stored.error_message, None);
            stored.attempts
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    for (_, order) in &seeded {
        assert_eq!(shop.orders.get(order.id).unwrap().unwrap().payment_status, PaymentStatus::Paid);
    }
}

#[test]
fn unsupported_event_is_skipped_without_provider_calls() {
    let shop = Shop::new();
    let event = WebhookEvent::failed(
        "evt_customer",
        EventKind::parse("customer.updated"),
        1,
        shop.ago(ChronoDuration::minutes(10)),
        "no handler",
    );
    shop.events.insert(event.clone()).unwrap();

    let report = shop.webhook_job(WebhookRetryConfig::default()).run().unwrap();

    let stored = shop.events.get(event.id).unwrap().unwrap();
    assert_eq!(stored.status, WebhookStatus::Skipped);
    assert_eq!(stored.attempts, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(shop.provider.calls().total(), 0);
}

#[test]
fn canceled_payment_fails_order_and_restores_stock_once() {
    let shop = Shop::with_stock(RecordingStockRestorer::failing("inventory service down"));
    let order = Order::pending("pi_cancel", shop.ago(ChronoDuration::hours(2)));
    shop.orders.insert(order.clone()).unwrap();
    shop.provider
        .put_intent(PaymentIntent::new("pi_cancel", IntentStatus::Canceled));

    let first = shop.payment_job().run().unwrap();
    let second = shop.payment_job().run().unwrap();

    assert_eq!(shop.orders.get(order.id).unwrap().unwrap().payment_status, PaymentStatus::Failed);
    assert_eq!(shop.stock.calls(), vec![order.id]);
    assert_eq!(first.stock_restore_failures, 1);
    assert_eq!(second.found, 0);
}

#[test]
fn phantom_refund_gets_exactly_one_audit_note() {
    let shop = Shop::new();
    let refund = Refund::new(OrderId::new(), 4_200, shop.ago(ChronoDuration::hours(25)));
    shop.refunds.insert(refund.clone()).unwrap();

    let report = shop.refund_job().run().unwrap();
    shop.refund_job().run().unwrap();

    assert_eq!(report.stale_alerted, 1);
    let notes = shop.notes.notes_for(refund.order_id).unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].refund_id, Some(refund.id));
    assert!(notes[0].message.contains(&refund.id.to_string()));
    assert_eq!(shop.refunds.get(refund.id).unwrap().unwrap().status, RefundStatus::Pending);
}

#[test]
fn side_effect_batch_cap_leaves_the_rest_untouched() {
    let clock = clock();
    let queue = InMemorySideEffectStore::arc();
    for i in 0..12 {
        let created_at = clock.now() - ChronoDuration::minutes(60 - i);
        queue
            .enqueue(FailedSideEffect::new(
                TaskKind::OrderConfirmationEmail,
                serde_json::json!({ "n": i }),
                "buyer@example.com",
                "smtp timeout",
                created_at,
            ))
            .unwrap();
    }
    let sent = Arc::new(Mutex::new(0));
    let counter = sent.clone();
    let registry = SideEffectRegistry::new().with(TaskKind::OrderConfirmationEmail, move |_, _| {
        *counter.lock().unwrap() += 1;
        Ok(())
    });
    let job = SideEffectRetryJob::new(
        queue.clone(),
        Arc::new(registry),
        SideEffectRetryConfig {
            batch_size: 10,
            max_attempts: 3,
        },
        BatchLimits::default(),
        clock,
    );

    let report = job.run().unwrap();

    assert_eq!(*sent.lock().unwrap(), 10);
    assert_eq!(report.found, 10);
    assert!(report.has_more);
    let pending: Vec<_> = queue
        .all()
        .unwrap()
        .into_iter()
        .filter(|e| e.status == SideEffectStatus::Pending)
        .collect();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|e| e.attempts == 0));
}

#[test]
fn redispatching_a_completed_event_does_not_reapply() {
    let shop = Shop::new();
    let (event, order) = shop.failed_payment_event(0, 0);
    shop.webhook_job(WebhookRetryConfig::default()).run().unwrap();
    assert_eq!(shop.events.get(event.id).unwrap().unwrap().status, WebhookStatus::Completed);

    let replay = ProviderEvent::new("evt_0", EventKind::PaymentIntentSucceeded, "pi_0");
    let tasks = shop.handlers().dispatch(&replay).unwrap();

    assert!(tasks.is_empty());
    assert_eq!(shop.orders.get(order.id).unwrap().unwrap().payment_status, PaymentStatus::Paid);
}

/// Order store whose selection keeps returning what it saw at construction,
/// like a second sync that read before the first one's write was visible.
struct StaleSelection {
    inner: Arc<InMemoryOrderStore>,
    frozen: Vec<Order>,
}

impl OrderStore for StaleSelection {
    fn insert(&self, order: Order) -> StoreResult<()> {
        self.inner.insert(order)
    }

    fn get(&self, id: OrderId) -> StoreResult<Option<Order>> {
        self.inner.get(id)
    }

    fn find_by_payment_ref(&self, external_payment_ref: &str) -> StoreResult<Option<Order>> {
        self.inner.find_by_payment_ref(external_payment_ref)
    }

    fn select_pending_payments(
        &self,
        _created_from: DateTime<Utc>,
        _created_to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Order>> {
        Ok(self.frozen.iter().take(limit).cloned().collect())
    }

    fn mark_paid_if_pending(&self, id: OrderId) -> StoreResult<bool> {
        self.inner.mark_paid_if_pending(id)
    }

    fn mark_failed_if_pending(&self, id: OrderId) -> StoreResult<bool> {
        self.inner.mark_failed_if_pending(id)
    }
}

#[test]
fn succeeded_intent_pays_the_order_exactly_once() {
    let shop = Shop::new();
    let order = Order::pending("pi_ok", shop.ago(ChronoDuration::hours(2)));
    shop.orders.insert(order.clone()).unwrap();
    shop.provider
        .put_intent(PaymentIntent::new("pi_ok", IntentStatus::Succeeded));
    let stale = Arc::new(StaleSelection {
        inner: shop.orders.clone(),
        frozen: vec![order.clone()],
    });
    let job = PaymentSyncJob::new(
        stale,
        shop.provider.clone(),
        shop.stock.clone(),
        shop.alerts.clone(),
        PaymentSyncConfig::default(),
        BatchLimits::default(),
        shop.clock.clone(),
    );

    let first = job.run().unwrap();
    let second = job.run().unwrap();

    assert_eq!((first.paid, second.paid), (1, 0));
    assert_eq!(second.found, 1);
    assert_eq!(shop.orders.get(order.id).unwrap().unwrap().payment_status, PaymentStatus::Paid);
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

    #[test]
    fn exhausted_events_are_never_selected_again(
        max_attempts in 1u32..5,
        attempts in prop::collection::vec(0u32..8, 1..12),
    ) {
        let shop = Shop::new();
        let seeded: Vec<_> = attempts
            .iter()
            .enumerate()
            .map(|(n, &a)| shop.failed_payment_event(n, a).0)
            .collect();
        let config = WebhookRetryConfig { max_attempts, ..WebhookRetryConfig::default() };

        let candidates = shop
            .events
            .select_retry_candidates(max_attempts, shop.clock.now(), 100)
            .unwrap();
        prop_assert!(candidates.iter().all(|e| e.attempts < max_attempts));

        shop.webhook_job(config).run().unwrap();

        for event in seeded.iter().filter(|e| e.attempts >= max_attempts) {
            let stored = shop.events.get(event.id).unwrap().unwrap();
            prop_assert_eq!(stored.status, WebhookStatus::Failed);
            prop_assert_eq!(stored.attempts, event.attempts);
        }
    }

    #[test]
    fn orphans_are_always_recovered(age_minutes in 11i64..500_000) {
        let shop = Shop::new();
        let mut event = WebhookEvent::received("evt_orphan", EventKind::PaymentIntentSucceeded, shop.ago(ChronoDuration::minutes(age_minutes)));
        event.processed_at = Some(event.received_at);
        shop.events.insert(event.clone()).unwrap();

        let report = shop.webhook_job(WebhookRetryConfig::default()).run().unwrap();

        prop_assert_eq!(report.orphans_recovered, 1);
        prop_assert_eq!(shop.events.get(event.id).unwrap().unwrap().status, WebhookStatus::Failed);
    }

    #[test]
    fn submitted_refunds_are_never_phantoms(age_hours in 25i64..20_000) {
        let shop = Shop::new();
        let at = shop.ago(ChronoDuration::hours(age_hours));
        let refund = Refund::new(OrderId::new(), 900, at).submitted("re_old", at);
        shop.refunds.insert(refund.clone()).unwrap();
        shop.provider
            .put_refund(ProviderRefund::new("re_old", ProviderRefundStatus::Pending));

        let report = shop.refund_job().run().unwrap();

        prop_assert_eq!(report.stale_found, 0);
        prop_assert!(shop.notes.all().unwrap().is_empty());
        prop_assert_eq!(shop.refunds.get(refund.id).unwrap().unwrap(), refund);
    }

    #[test]
    fn deadline_leaves_later_items_untouched(items in 1usize..20, budget_secs in 1u64..25) {
        let clock = clock();
        let queue = InMemorySideEffectStore::arc();
        let mut ids = Vec::new();
        for i in 0..items {
            let created_at = clock.now() - ChronoDuration::minutes(100 - i as i64);
            ids.push(
                queue
                    .enqueue(FailedSideEffect::new(
                        TaskKind::RefundProcessedEmail,
                        serde_json::Value::Null,
                        "buyer@example.com",
                        "smtp timeout",
                        created_at,
                    ))
                    .unwrap(),
            );
        }
        // Every send takes one second.
        let slow = clock.clone();
        let registry = SideEffectRegistry::new().with(TaskKind::RefundProcessedEmail, move |_, _| {
            slow.advance(Duration::from_secs(1));
            Ok(())
        });
        let job = SideEffectRetryJob::new(
            queue.clone(),
            Arc::new(registry),
            SideEffectRetryConfig { batch_size: 50, max_attempts: 3 },
            BatchLimits { deadline: Duration::from_secs(budget_secs), ..BatchLimits::default() },
            clock,
        );

        let report = job.run().unwrap();

        let processed = items.min(budget_secs as usize);
        prop_assert_eq!(report.succeeded, processed);
        prop_assert_eq!(report.deadline_hit, items > processed);
        for (i, id) in ids.iter().enumerate() {
            let effect = queue.get(*id).unwrap().unwrap();
            if i < processed {
                prop_assert_eq!(effect.status, SideEffectStatus::Retried);
            } else {
                prop_assert_eq!(effect.status, SideEffectStatus::Pending);
                prop_assert_eq!(effect.attempts, 0);
            }
        }
    }
}
