//! Record stores used by the reconciliation jobs.
//!
//! Conditional transitions (`claim_for_retry`, `mark_paid_if_pending`, ...)
//! are single atomic compare-and-set operations: they return `false`/`None`
//! when the record is no longer in the expected state, which is how
//! concurrent or repeated invocations stay idempotent.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use settle_core::{OrderId, RefundId, SideEffectId, StoreError, StoreResult, WebhookEventId};

use crate::model::{
    AuditNote, FailedSideEffect, Order, PaymentStatus, Refund, RefundStatus, SideEffectStatus,
    WebhookEvent, WebhookStatus,
};

/// Webhook event persistence.
pub trait WebhookEventStore: Send + Sync {
    fn insert(&self, event: WebhookEvent) -> StoreResult<()>;

    fn get(&self, id: WebhookEventId) -> StoreResult<Option<WebhookEvent>>;

    /// Force every `PROCESSING` event last touched before `touched_before` to
    /// `FAILED` with `message`. Returns the recovered ids.
    fn recover_orphans(
        &self,
        touched_before: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<WebhookEventId>>;

    /// `FAILED` events with `attempts < max_attempts` last touched before
    /// `touched_before`, oldest first, at most `limit`.
    fn select_retry_candidates(
        &self,
        max_attempts: u32,
        touched_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<WebhookEvent>>;

    /// Atomically claim a retry: `FAILED → PROCESSING`, `attempts += 1`,
    /// `processed_at = now`. Returns the claimed record, or `None` if the
    /// event was no longer eligible.
    fn claim_for_retry(
        &self,
        id: WebhookEventId,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<WebhookEvent>>;

    fn mark_completed(&self, id: WebhookEventId, now: DateTime<Utc>) -> StoreResult<()>;

    fn mark_failed(&self, id: WebhookEventId, error: &str, now: DateTime<Utc>) -> StoreResult<()>;

    fn mark_skipped(&self, id: WebhookEventId, reason: &str, now: DateTime<Utc>) -> StoreResult<()>;
}

/// Order payment state persistence.
pub trait OrderStore: Send + Sync {
    fn insert(&self, order: Order) -> StoreResult<()>;

    fn get(&self, id: OrderId) -> StoreResult<Option<Order>>;

    fn find_by_payment_ref(&self, external_payment_ref: &str) -> StoreResult<Option<Order>>;

    /// `PENDING` orders with a payment reference created within
    /// `[created_from, created_to]`, oldest first, at most `limit`.
    fn select_pending_payments(
        &self,
        created_from: DateTime<Utc>,
        created_to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Order>>;

    /// `PENDING → PAID`. Returns whether this call made the transition.
    fn mark_paid_if_pending(&self, id: OrderId) -> StoreResult<bool>;

    /// `PENDING → FAILED`. Returns whether this call made the transition.
    fn mark_failed_if_pending(&self, id: OrderId) -> StoreResult<bool>;
}

/// Refund persistence.
pub trait RefundStore: Send + Sync {
    fn insert(&self, refund: Refund) -> StoreResult<()>;

    fn get(&self, id: RefundId) -> StoreResult<Option<Refund>>;

    fn find_by_external_ref(&self, external_refund_ref: &str) -> StoreResult<Option<Refund>>;

    /// `APPROVED` refunds with an external reference, last processed before
    /// `processed_before`, oldest first.
    fn select_in_flight(&self, processed_before: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Refund>>;

    /// `PENDING`/`APPROVED` refunds without an external reference created
    /// before `created_before`, oldest first, skipping ids in `already_noted`.
    fn select_phantoms(
        &self,
        created_before: DateTime<Utc>,
        already_noted: &HashSet<RefundId>,
        limit: usize,
    ) -> StoreResult<Vec<Refund>>;

    /// `APPROVED → COMPLETED`. Returns whether this call made the transition.
    fn complete_if_approved(&self, id: RefundId, now: DateTime<Utc>) -> StoreResult<bool>;

    /// `APPROVED → FAILED` with `reason`. Returns whether this call made the transition.
    fn fail_if_approved(&self, id: RefundId, reason: &str, now: DateTime<Utc>) -> StoreResult<bool>;
}

/// Failed side-effect queue persistence.
pub trait SideEffectStore: Send + Sync {
    fn enqueue(&self, effect: FailedSideEffect) -> StoreResult<SideEffectId>;

    fn get(&self, id: SideEffectId) -> StoreResult<Option<FailedSideEffect>>;

    /// `PENDING` entries with `attempts < max_attempts`, oldest first.
    fn select_pending(&self, max_attempts: u32, limit: usize) -> StoreResult<Vec<FailedSideEffect>>;

    fn mark_retried(&self, id: SideEffectId) -> StoreResult<()>;

    fn mark_exhausted(&self, id: SideEffectId, reason: &str) -> StoreResult<()>;

    /// Count one failed attempt. Moves to `EXHAUSTED` once `attempts >= max_attempts`.
    /// Returns the resulting status.
    fn record_failure(
        &self,
        id: SideEffectId,
        error: &str,
        max_attempts: u32,
    ) -> StoreResult<SideEffectStatus>;
}

/// Operator-facing notes attached to orders.
pub trait AuditNoteStore: Send + Sync {
    /// Add a note. A note about a refund is kept once per `(order, refund)`;
    /// returns `false` when an equivalent note already exists.
    fn add_note(&self, note: AuditNote) -> StoreResult<bool>;

    fn notes_for(&self, order_id: OrderId) -> StoreResult<Vec<AuditNote>>;

    /// Refunds that already carry a note.
    fn noted_refunds(&self) -> StoreResult<HashSet<RefundId>>;
}

fn read<T>(lock: &RwLock<T>) -> StoreResult<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| StoreError::poisoned())
}

fn write<T>(lock: &RwLock<T>) -> StoreResult<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| StoreError::poisoned())
}

/// In-memory webhook event store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryWebhookEventStore {
    events: RwLock<HashMap<WebhookEventId, WebhookEvent>>,
}

impl InMemoryWebhookEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// All events ordered by arrival.
    pub fn all(&self) -> StoreResult<Vec<WebhookEvent>> {
        let mut all: Vec<_> = read(&self.events)?.values().cloned().collect();
        all.sort_by_key(|e| (e.received_at, e.id));
        Ok(all)
    }

    fn update<F>(&self, id: WebhookEventId, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut WebhookEvent),
    {
        let mut events = write(&self.events)?;
        let event = events.get_mut(&id).ok_or_else(|| StoreError::not_found(id))?;
        f(event);
        Ok(())
    }
}

impl WebhookEventStore for InMemoryWebhookEventStore {
    fn insert(&self, event: WebhookEvent) -> StoreResult<()> {
        let mut events = write(&self.events)?;
        if events.contains_key(&event.id) {
            return Err(StoreError::AlreadyExists(event.id.to_string()));
        }
        events.insert(event.id, event);
        Ok(())
    }

    fn get(&self, id: WebhookEventId) -> StoreResult<Option<WebhookEvent>> {
        Ok(read(&self.events)?.get(&id).cloned())
    }

    fn recover_orphans(
        &self,
        touched_before: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<WebhookEventId>> {
        let mut events = write(&self.events)?;
        let mut recovered = Vec::new();
        for event in events.values_mut() {
            if event.is_orphaned(touched_before) {
                event.status = WebhookStatus::Failed;
                event.error_message = Some(message.to_string());
                event.processed_at = Some(now);
                recovered.push(event.id);
            }
        }
        recovered.sort();
        Ok(recovered)
    }

    fn select_retry_candidates(
        &self,
        max_attempts: u32,
        touched_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<WebhookEvent>> {
        let events = read(&self.events)?;
        let mut candidates: Vec<_> = events
            .values()
            .filter(|e| e.is_retry_eligible(max_attempts, touched_before))
            .cloned()
            .collect();

        candidates.sort_by_key(|e| (e.received_at, e.id));
        candidates.truncate(limit);
        Ok(candidates)
    }

    fn claim_for_retry(
        &self,
        id: WebhookEventId,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<WebhookEvent>> {
        let mut events = write(&self.events)?;
        match events.get_mut(&id) {
            Some(event) if event.status == WebhookStatus::Failed && event.attempts < max_attempts => {
                event.status = WebhookStatus::Processing;
                event.attempts += 1;
                event.processed_at = Some(now);
                Ok(Some(event.clone()))
            }
            Some(_) => Ok(None),
            None => Err(StoreError::not_found(id)),
        }
    }

    fn mark_completed(&self, id: WebhookEventId, now: DateTime<Utc>) -> StoreResult<()> {
        self.update(id, |e| {
            e.status = WebhookStatus::Completed;
            e.error_message = None;
            e.processed_at = Some(now);
        })
    }

    fn mark_failed(&self, id: WebhookEventId, error: &str, now: DateTime<Utc>) -> StoreResult<()> {
        self.update(id, |e| {
            e.status = WebhookStatus::Failed;
            e.error_message = Some(error.to_string());
            e.processed_at = Some(now);
        })
    }

    fn mark_skipped(&self, id: WebhookEventId, reason: &str, now: DateTime<Utc>) -> StoreResult<()> {
        self.update(id, |e| {
            e.status = WebhookStatus::Skipped;
            e.error_message = Some(reason.to_string());
            e.processed_at = Some(now);
        })
    }
}

/// In-memory order store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<HashMap<OrderId, Order>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn all(&self) -> StoreResult<Vec<Order>> {
        let mut all: Vec<_> = read(&self.orders)?.values().cloned().collect();
        all.sort_by_key(|o| (o.created_at, o.id));
        Ok(all)
    }

    fn transition(&self, id: OrderId, from: PaymentStatus, to: PaymentStatus) -> StoreResult<bool> {
        let mut orders = write(&self.orders)?;
        let order = orders.get_mut(&id).ok_or_else(|| StoreError::not_found(id))?;
        if order.payment_status != from {
            return Ok(false);
        }
        order.payment_status = to;
        Ok(true)
    }
}

impl OrderStore for InMemoryOrderStore {
    fn insert(&self, order: Order) -> StoreResult<()> {
        let mut orders = write(&self.orders)?;
        if orders.contains_key(&order.id) {
            return Err(StoreError::AlreadyExists(order.id.to_string()));
        }
        orders.insert(order.id, order);
        Ok(())
    }

    fn get(&self, id: OrderId) -> StoreResult<Option<Order>> {
        Ok(read(&self.orders)?.get(&id).cloned())
    }

    fn find_by_payment_ref(&self, external_payment_ref: &str) -> StoreResult<Option<Order>> {
        Ok(read(&self.orders)?
            .values()
            .find(|o| o.external_payment_ref.as_deref() == Some(external_payment_ref))
            .cloned())
    }

    fn select_pending_payments(
        &self,
        created_from: DateTime<Utc>,
        created_to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Order>> {
        let orders = read(&self.orders)?;
        let mut pending: Vec<_> = orders
            .values()
            .filter(|o| {
                o.payment_status == PaymentStatus::Pending
                    && o.external_payment_ref.is_some()
                    && o.created_at >= created_from
                    && o.created_at <= created_to
            })
            .cloned()
            .collect();

        pending.sort_by_key(|o| (o.created_at, o.id));
        pending.truncate(limit);
        Ok(pending)
    }

    fn mark_paid_if_pending(&self, id: OrderId) -> StoreResult<bool> {
        self.transition(id, PaymentStatus::Pending, PaymentStatus::Paid)
    }

    fn mark_failed_if_pending(&self, id: OrderId) -> StoreResult<bool> {
        self.transition(id, PaymentStatus::Pending, PaymentStatus::Failed)
    }
}

/// In-memory refund store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRefundStore {
    refunds: RwLock<HashMap<RefundId, Refund>>,
}

impl InMemoryRefundStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn all(&self) -> StoreResult<Vec<Refund>> {
        let mut all: Vec<_> = read(&self.refunds)?.values().cloned().collect();
        all.sort_by_key(|r| (r.created_at, r.id));
        Ok(all)
    }

    fn select<P>(&self, limit: usize, predicate: P) -> StoreResult<Vec<Refund>>
    where
        P: Fn(&Refund) -> bool,
    {
        let refunds = read(&self.refunds)?;
        let mut selected: Vec<_> = refunds.values().filter(|r| predicate(r)).cloned().collect();
        selected.sort_by_key(|r| (r.created_at, r.id));
        selected.truncate(limit);
        Ok(selected)
    }

    fn resolve(&self, id: RefundId, to: RefundStatus, reason: Option<&str>, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut refunds = write(&self.refunds)?;
        let refund = refunds.get_mut(&id).ok_or_else(|| StoreError::not_found(id))?;
        if refund.status != RefundStatus::Approved {
            return Ok(false);
        }
        refund.status = to;
        refund.failure_reason = reason.map(str::to_string);
        refund.processed_at = Some(now);
        Ok(true)
    }
}

impl RefundStore for InMemoryRefundStore {
    fn insert(&self, refund: Refund) -> StoreResult<()> {
        let mut refunds = write(&self.refunds)?;
        if refunds.contains_key(&refund.id) {
            return Err(StoreError::AlreadyExists(refund.id.to_string()));
        }
        refunds.insert(refund.id, refund);
        Ok(())
    }

    fn get(&self, id: RefundId) -> StoreResult<Option<Refund>> {
        Ok(read(&self.refunds)?.get(&id).cloned())
    }

    fn find_by_external_ref(&self, external_refund_ref: &str) -> StoreResult<Option<Refund>> {
        Ok(read(&self.refunds)?
            .values()
            .find(|r| r.external_refund_ref.as_deref() == Some(external_refund_ref))
            .cloned())
    }

    fn select_in_flight(&self, processed_before: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Refund>> {
        self.select(limit, |r| {
            r.status == RefundStatus::Approved
                && r.external_refund_ref.is_some()
                && r.processed_at.unwrap_or(r.created_at) < processed_before
        })
    }

    fn select_phantoms(
        &self,
        created_before: DateTime<Utc>,
        already_noted: &HashSet<RefundId>,
        limit: usize,
    ) -> StoreResult<Vec<Refund>> {
        self.select(limit, |r| {
            r.is_phantom() && r.created_at < created_before && !already_noted.contains(&r.id)
        })
    }

    fn complete_if_approved(&self, id: RefundId, now: DateTime<Utc>) -> StoreResult<bool> {
        self.resolve(id, RefundStatus::Completed, None, now)
    }

    fn fail_if_approved(&self, id: RefundId, reason: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        self.resolve(id, RefundStatus::Failed, Some(reason), now)
    }
}

/// In-memory side-effect queue for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySideEffectStore {
    effects: RwLock<HashMap<SideEffectId, FailedSideEffect>>,
}

impl InMemorySideEffectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn all(&self) -> StoreResult<Vec<FailedSideEffect>> {
        let mut all: Vec<_> = read(&self.effects)?.values().cloned().collect();
        all.sort_by_key(|e| (e.created_at, e.id));
        Ok(all)
    }

    fn update<F, T>(&self, id: SideEffectId, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut FailedSideEffect) -> T,
    {
        let mut effects = write(&self.effects)?;
        let effect = effects.get_mut(&id).ok_or_else(|| StoreError::not_found(id))?;
        Ok(f(effect))
    }
}

impl SideEffectStore for InMemorySideEffectStore {
    fn enqueue(&self, effect: FailedSideEffect) -> StoreResult<SideEffectId> {
        let mut effects = write(&self.effects)?;
        if effects.contains_key(&effect.id) {
            return Err(StoreError::AlreadyExists(effect.id.to_string()));
        }
        let id = effect.id;
        effects.insert(id, effect);
        Ok(id)
    }

    fn get(&self, id: SideEffectId) -> StoreResult<Option<FailedSideEffect>> {
        Ok(read(&self.effects)?.get(&id).cloned())
    }

    fn select_pending(&self, max_attempts: u32, limit: usize) -> StoreResult<Vec<FailedSideEffect>> {
        let effects = read(&self.effects)?;
        let mut pending: Vec<_> = effects
            .values()
            .filter(|e| e.status == SideEffectStatus::Pending && e.attempts < max_attempts)
            .cloned()
            .collect();

        pending.sort_by_key(|e| (e.created_at, e.id));
        pending.truncate(limit);
        Ok(pending)
    }

    fn mark_retried(&self, id: SideEffectId) -> StoreResult<()> {
        self.update(id, |e| {
            e.status = SideEffectStatus::Retried;
        })
    }

    fn mark_exhausted(&self, id: SideEffectId, reason: &str) -> StoreResult<()> {
        self.update(id, |e| {
            e.status = SideEffectStatus::Exhausted;
            e.last_error = Some(reason.to_string());
        })
    }

    fn record_failure(
        &self,
        id: SideEffectId,
        error: &str,
        max_attempts: u32,
    ) -> StoreResult<SideEffectStatus> {
        self.update(id, |e| {
            e.attempts += 1;
            e.last_error = Some(error.to_string());
            if e.attempts >= max_attempts {
                e.status = SideEffectStatus::Exhausted;
            }
            e.status
        })
    }
}

/// In-memory audit notes for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAuditNoteStore {
    notes: RwLock<Vec<AuditNote>>,
}

impl InMemoryAuditNoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn all(&self) -> StoreResult<Vec<AuditNote>> {
        Ok(read(&self.notes)?.clone())
    }
}

impl AuditNoteStore for InMemoryAuditNoteStore {
    fn add_note(&self, note: AuditNote) -> StoreResult<bool> {
        let mut notes = write(&self.notes)?;
        let duplicate = note.refund_id.is_some()
            && notes
                .iter()
                .any(|n| n.order_id == note.order_id && n.refund_id == note.refund_id);
        if duplicate {
            return Ok(false);
        }
        notes.push(note);
        Ok(true)
    }

    fn notes_for(&self, order_id: OrderId) -> StoreResult<Vec<AuditNote>> {
        Ok(read(&self.notes)?
            .iter()
            .filter(|n| n.order_id == order_id)
            .cloned()
            .collect())
    }

    fn noted_refunds(&self) -> StoreResult<HashSet<RefundId>> {
        Ok(read(&self.notes)?.iter().filter_map(|n| n.refund_id).collect())
    }
}
