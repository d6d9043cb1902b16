//! Retry queue for side effects that could not complete synchronously.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use settle_core::{Clock, SideEffectId};

use crate::batch::{BatchExecutor, BatchItem, Deadline, ItemError, Outcome};
use crate::config::{BatchLimits, SideEffectRetryConfig};
use crate::error::JobError;
use crate::job::ReconcileJob;
use crate::model::{FailedSideEffect, SideEffectStatus, TaskKind};
use crate::store::SideEffectStore;

/// Side-effect handler: `(payload, destination) -> Result`.
pub type SideEffectHandler = Box<dyn Fn(&serde_json::Value, &str) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SideEffectError {
    #[error("no handler registered for task kind {0}")]
    Unregistered(TaskKind),

    #[error("{0}")]
    Failed(String),
}

/// Task kind → handler table, built once at startup.
#[derive(Default)]
pub struct SideEffectRegistry {
    handlers: HashMap<TaskKind, SideEffectHandler>,
}

impl SideEffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: TaskKind, handler: F)
    where
        F: Fn(&serde_json::Value, &str) -> Result<(), String> + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Box::new(handler));
    }

    pub fn with<F>(mut self, kind: TaskKind, handler: F) -> Self
    where
        F: Fn(&serde_json::Value, &str) -> Result<(), String> + Send + Sync + 'static,
    {
        self.register(kind, handler);
        self
    }

    pub fn is_registered(&self, kind: &TaskKind) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn execute(
        &self,
        kind: &TaskKind,
        payload: &serde_json::Value,
        destination: &str,
    ) -> Result<(), SideEffectError> {
        let handler = self
            .handlers
            .get(kind)
            .ok_or_else(|| SideEffectError::Unregistered(kind.clone()))?;
        handler(payload, destination).map_err(SideEffectError::Failed)
    }
}

impl core::fmt::Debug for SideEffectRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SideEffectRegistry")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BatchItem for FailedSideEffect {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SideEffectRetryReport {
    pub found: usize,
    /// Handlers invoked.
    pub retried: usize,
    pub succeeded: usize,
    /// Attempts that failed but stay `PENDING`.
    pub failed: usize,
    /// Entries moved to `EXHAUSTED` this run.
    pub exhausted: usize,
    pub has_more: bool,
    pub deadline_hit: bool,
}

/// Retries `PENDING` failed side effects through the registry.
pub struct SideEffectRetryJob {
    store: Arc<dyn SideEffectStore>,
    registry: Arc<SideEffectRegistry>,
    config: SideEffectRetryConfig,
    limits: BatchLimits,
    clock: Arc<dyn Clock>,
}

impl SideEffectRetryJob {
    pub fn new(
        store: Arc<dyn SideEffectStore>,
        registry: Arc<SideEffectRegistry>,
        config: SideEffectRetryConfig,
        limits: BatchLimits,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            limits,
            clock,
        }
    }

    fn retry_one(&self, effect: &FailedSideEffect, report: &mut SideEffectRetryReport) -> Result<Outcome, ItemError> {
        if !self.registry.is_registered(&effect.task_kind) {
            let reason = SideEffectError::Unregistered(effect.task_kind.clone()).to_string();
            self.exhaust(effect.id, &reason)?;
            report.exhausted += 1;
            return Err(ItemError::Terminal(reason));
        }

        report.retried += 1;
        match self
            .registry
            .execute(&effect.task_kind, &effect.payload, &effect.destination)
        {
            Ok(()) => {
                self.store
                    .mark_retried(effect.id)
                    .map_err(|e| ItemError::retryable(e.to_string()))?;
                report.succeeded += 1;
                debug!(side_effect = %effect.id, kind = %effect.task_kind, "side effect recovered");
                Ok(Outcome::Succeeded)
            }
            Err(err) => {
                let error = err.to_string();
                let status = self
                    .store
                    .record_failure(effect.id, &error, self.config.max_attempts)
                    .map_err(|e| ItemError::retryable(e.to_string()))?;

                if status == SideEffectStatus::Exhausted {
                    report.exhausted += 1;
                    warn!(
                        side_effect = %effect.id,
                        kind = %effect.task_kind,
                        destination = %effect.destination,
                        error = %error,
                        "side effect exhausted its retries; needs a manual resend"
                    );
                    Err(ItemError::Terminal(error))
                } else {
                    report.failed += 1;
                    Err(ItemError::Retryable(error))
                }
            }
        }
    }

    fn exhaust(&self, id: SideEffectId, reason: &str) -> Result<(), ItemError> {
        warn!(side_effect = %id, reason, "side effect can never succeed; exhausting");
        self.store
            .mark_exhausted(id, reason)
            .map_err(|e| ItemError::retryable(e.to_string()))
    }
}

impl ReconcileJob for SideEffectRetryJob {
    type Report = SideEffectRetryReport;

    fn name(&self) -> &'static str {
        "side_effect_retry"
    }

    fn run(&self) -> Result<SideEffectRetryReport, JobError> {
        let deadline = Deadline::start(self.clock.clone(), self.limits.deadline);
        let executor = BatchExecutor::new(self.name(), self.config.batch_size);
        let mut report = SideEffectRetryReport::default();
        let max_attempts = self.config.max_attempts;

        let summary = executor.run(
            &deadline,
            |limit| self.store.select_pending(max_attempts, limit),
            |effect| self.retry_one(effect, &mut report),
        )?;

        report.found = summary.found;
        report.has_more = summary.has_more;
        report.deadline_hit = summary.deadline_hit;

        info!(
            job = self.name(),
            found = report.found,
            succeeded = report.succeeded,
            failed = report.failed,
            exhausted = report.exhausted,
            has_more = report.has_more,
            "side effect retry finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySideEffectStore;
    use chrono::Utc;
    use settle_core::ManualClock;

    fn job(store: Arc<InMemorySideEffectStore>, registry: SideEffectRegistry) -> SideEffectRetryJob {
        SideEffectRetryJob::new(
            store,
            Arc::new(registry),
            SideEffectRetryConfig {
                batch_size: 10,
                max_attempts: 2,
            },
            BatchLimits::default(),
            Arc::new(ManualClock::new(Utc::now())),
        )
    }

    fn enqueue(store: &InMemorySideEffectStore, kind: TaskKind) -> SideEffectId {
        store
            .enqueue(FailedSideEffect::new(
                kind,
                serde_json::json!({"order": "o-1"}),
                "buyer@example.com",
                "smtp timeout",
                Utc::now(),
            ))
            .unwrap()
    }

    #[test]
    fn successful_retry_is_terminal() {
        let store = InMemorySideEffectStore::arc();
        let id = enqueue(&store, TaskKind::OrderConfirmationEmail);
        let registry = SideEffectRegistry::new().with(TaskKind::OrderConfirmationEmail, |payload, to| {
            assert_eq!(payload["order"], "o-1");
            assert_eq!(to, "buyer@example.com");
            Ok(())
        });

        let report = job(store.clone(), registry).run().unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(store.get(id).unwrap().unwrap().status, SideEffectStatus::Retried);
    }

    #[test]
    fn unregistered_kind_is_exhausted_without_attempts() {
        let store = InMemorySideEffectStore::arc();
        let id = enqueue(&store, TaskKind::Other("fax".to_string()));

        let report = job(store.clone(), SideEffectRegistry::new()).run().unwrap();

        let effect = store.get(id).unwrap().unwrap();
        assert_eq!(effect.status, SideEffectStatus::Exhausted);
        assert_eq!(effect.attempts, 0);
        assert_eq!(report.exhausted, 1);
        assert_eq!(report.retried, 0);
    }

    #[test]
    fn failures_count_up_to_exhaustion() {
        let store = InMemorySideEffectStore::arc();
        let id = enqueue(&store, TaskKind::PaymentFailedEmail);
        let registry = Arc::new(
            SideEffectRegistry::new().with(TaskKind::PaymentFailedEmail, |_, _| Err("mailbox full".to_string())),
        );
        let job = SideEffectRetryJob::new(
            store.clone(),
            registry,
            SideEffectRetryConfig {
                batch_size: 10,
                max_attempts: 2,
            },
            BatchLimits::default(),
            Arc::new(ManualClock::new(Utc::now())),
        );

        let first = job.run().unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(store.get(id).unwrap().unwrap().status, SideEffectStatus::Pending);

        let second = job.run().unwrap();
        assert_eq!(second.exhausted, 1);
        let effect = store.get(id).unwrap().unwrap();
        assert_eq!(effect.status, SideEffectStatus::Exhausted);
        assert_eq!(effect.attempts, 2);
        assert_eq!(effect.last_error.as_deref(), Some("mailbox full"));

        assert_eq!(job.run().unwrap().found, 0);
    }
}
