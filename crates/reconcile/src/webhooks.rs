//! Webhook retry coordinator.
//!
//! Every invocation first recovers orphaned `PROCESSING` events, then retries
//! `FAILED` events through the dispatch table. Retries are claimed with one
//! atomic claim-and-increment before dispatch, so a crash mid-dispatch leaves
//! the event `PROCESSING` for the next run's orphan recovery.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use settle_core::{Clock, StoreError};

use crate::batch::{cutoff, BatchExecutor, BatchItem, Deadline, ItemError, Outcome};
use crate::config::{BatchLimits, WebhookRetryConfig};
use crate::error::JobError;
use crate::job::ReconcileJob;
use crate::model::{EventKind, FailedSideEffect, TaskKind, WebhookEvent};
use crate::provider::{PaymentProvider, ProviderEvent, TimeoutProvider};
use crate::side_effects::SideEffectRegistry;
use crate::store::{SideEffectStore, WebhookEventStore};

const ORPHAN_MESSAGE: &str = "processing did not finish before the orphan threshold; recovered for retry";

/// Work a handler asks for after its domain mutation committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FollowUpTask {
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub destination: String,
}

impl FollowUpTask {
    pub fn new(kind: TaskKind, payload: serde_json::Value, destination: impl Into<String>) -> Self {
        Self {
            kind,
            payload,
            destination: destination.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unsupported event kind: {0}")]
    Unsupported(EventKind),

    #[error("malformed event payload: {0}")]
    Malformed(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Handler(String),
}

/// Event kind → handler table.
///
/// Handlers must be idempotent: delivery and retry are at-least-once.
pub trait WebhookDispatcher: Send + Sync {
    fn supports(&self, kind: &EventKind) -> bool;

    fn dispatch(&self, event: &ProviderEvent) -> Result<Vec<FollowUpTask>, DispatchError>;
}

impl BatchItem for WebhookEvent {
    fn key(&self) -> String {
        format!("{} ({})", self.id, self.external_event_id)
    }
}

/// Runs follow-up tasks inline; failures go to the side-effect queue.
pub struct FollowUps {
    registry: Arc<SideEffectRegistry>,
    queue: Arc<dyn SideEffectStore>,
}

impl FollowUps {
    pub fn new(registry: Arc<SideEffectRegistry>, queue: Arc<dyn SideEffectStore>) -> Self {
        Self { registry, queue }
    }

    /// Best-effort: returns the number of tasks enqueued for a later retry.
    pub fn run(&self, tasks: Vec<FollowUpTask>, clock: &dyn Clock) -> usize {
        let mut enqueued = 0;
        for task in tasks {
            let Err(err) = self.registry.execute(&task.kind, &task.payload, &task.destination) else {
                continue;
            };

            warn!(kind = %task.kind, destination = %task.destination, error = %err, "follow-up task failed; queueing for retry");
            let kind = task.kind.clone();
            let entry = FailedSideEffect::new(task.kind, task.payload, task.destination, err.to_string(), clock.now());
            match self.queue.enqueue(entry) {
                Ok(id) => {
                    debug!(side_effect = %id, kind = %kind, "follow-up task queued");
                    enqueued += 1;
                }
                Err(e) => warn!(kind = %kind, error = %e, "could not queue failed follow-up task"),
            }
        }
        enqueued
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WebhookRetryReport {
    pub orphans_recovered: usize,
    pub found: usize,
    /// Events claimed and dispatched.
    pub retried: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub follow_ups_enqueued: usize,
    pub has_more: bool,
    pub deadline_hit: bool,
}

pub struct WebhookRetryJob {
    events: Arc<dyn WebhookEventStore>,
    provider: TimeoutProvider,
    dispatcher: Arc<dyn WebhookDispatcher>,
    follow_ups: FollowUps,
    config: WebhookRetryConfig,
    limits: BatchLimits,
    clock: Arc<dyn Clock>,
}

impl WebhookRetryJob {
    pub fn new(
        events: Arc<dyn WebhookEventStore>,
        provider: Arc<dyn PaymentProvider>,
        dispatcher: Arc<dyn WebhookDispatcher>,
        follow_ups: FollowUps,
        config: WebhookRetryConfig,
        limits: BatchLimits,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            events,
            provider: TimeoutProvider::new(provider, limits.call_timeout),
            dispatcher,
            follow_ups,
            config,
            limits,
            clock,
        }
    }

    fn recover_orphans(&self) -> Result<usize, JobError> {
        let now = self.clock.now();
        let recovered = self
            .events
            .recover_orphans(cutoff(now, self.config.orphan_threshold), ORPHAN_MESSAGE, now)?;
        for id in &recovered {
            warn!(event_id = %id, "recovered orphaned webhook event");
        }
        Ok(recovered.len())
    }

    fn skip(&self, event: &WebhookEvent, reason: &str, report: &mut WebhookRetryReport) -> Result<Outcome, ItemError> {
        self.events
            .mark_skipped(event.id, reason, self.clock.now())
            .map_err(|e| ItemError::retryable(e.to_string()))?;
        report.skipped += 1;
        debug!(event_id = %event.id, kind = %event.event_kind, reason, "webhook event skipped");
        Ok(Outcome::Skipped)
    }

    /// Record a failed attempt on a claimed event.
    fn fail(&self, claimed: &WebhookEvent, error: &str, report: &mut WebhookRetryReport) -> ItemError {
        report.failed += 1;
        if let Err(e) = self.events.mark_failed(claimed.id, error, self.clock.now()) {
            return ItemError::retryable(format!("{error}; also failed to record the failure: {e}"));
        }

        if claimed.attempts >= self.config.max_attempts {
            warn!(
                event_id = %claimed.id,
                external_event_id = %claimed.external_event_id,
                attempts = claimed.attempts,
                error,
                "webhook retries exhausted; needs manual follow-up"
            );
            ItemError::terminal(error)
        } else {
            ItemError::retryable(error)
        }
    }

    fn claim(&self, event: &WebhookEvent) -> Result<Option<WebhookEvent>, ItemError> {
        let claimed = self
            .events
            .claim_for_retry(event.id, self.config.max_attempts, self.clock.now())
            .map_err(|e| ItemError::retryable(e.to_string()))?;
        if claimed.is_none() {
            debug!(event_id = %event.id, "webhook event no longer eligible; another run took it");
        }
        Ok(claimed)
    }

    fn retry_one(&self, event: &WebhookEvent, report: &mut WebhookRetryReport) -> Result<Outcome, ItemError> {
        if !self.dispatcher.supports(&event.event_kind) {
            let reason = format!("unsupported event kind: {}", event.event_kind);
            return self.skip(event, &reason, report);
        }

        let fetched = match self.provider.retrieve_event(&event.external_event_id) {
            Ok(fetched) => fetched,
            Err(err) if err.is_permanent() => {
                let reason = format!("provider no longer has this event: {err}");
                return self.skip(event, &reason, report);
            }
            Err(err) => {
                let Some(claimed) = self.claim(event)? else {
                    return Ok(Outcome::Unchanged);
                };
                return Err(self.fail(&claimed, &format!("could not fetch event: {err}"), report));
            }
        };

        // The stored kind can disagree with what the provider now reports.
        if !self.dispatcher.supports(&fetched.kind) {
            let reason = format!("unsupported event kind: {}", fetched.kind);
            return self.skip(event, &reason, report);
        }

        let Some(claimed) = self.claim(event)? else {
            return Ok(Outcome::Unchanged);
        };
        report.retried += 1;

        match self.dispatcher.dispatch(&fetched) {
            Ok(tasks) => {
                self.events
                    .mark_completed(claimed.id, self.clock.now())
                    .map_err(|e| ItemError::retryable(e.to_string()))?;
                report.succeeded += 1;
                debug!(event_id = %claimed.id, attempts = claimed.attempts, tasks = tasks.len(), "webhook event completed");
                report.follow_ups_enqueued += self.follow_ups.run(tasks, self.clock.as_ref());
                Ok(Outcome::Succeeded)
            }
            Err(err) => Err(self.fail(&claimed, &err.to_string(), report)),
        }
    }
}

impl ReconcileJob for WebhookRetryJob {
    type Report = WebhookRetryReport;

    fn name(&self) -> &'static str {
        "webhook_retry"
    }

    fn run(&self) -> Result<WebhookRetryReport, JobError> {
        let deadline = Deadline::start(self.clock.clone(), self.limits.deadline);
        let mut report = WebhookRetryReport {
            orphans_recovered: self.recover_orphans()?,
            ..WebhookRetryReport::default()
        };

        let executor = BatchExecutor::new(self.name(), self.config.batch_size);
        let touched_before = cutoff(self.clock.now(), self.config.cooldown);
        let max_attempts = self.config.max_attempts;

        let summary = executor.run(
            &deadline,
            |limit| self.events.select_retry_candidates(max_attempts, touched_before, limit),
            |event| self.retry_one(event, &mut report),
        )?;

        report.found = summary.found;
        report.has_more = summary.has_more;
        report.deadline_hit = summary.deadline_hit;

        info!(
            job = self.name(),
            orphans_recovered = report.orphans_recovered,
            found = report.found,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            has_more = report.has_more,
            "webhook retry finished"
        );
        Ok(report)
    }
}
