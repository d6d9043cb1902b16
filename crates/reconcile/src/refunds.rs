//! Refund reconciliation.
//!
//! Phase A polls the provider for refunds that were submitted upstream and are
//! still `APPROVED` locally. Phase B finds phantom refunds (decided but never
//! submitted) and leaves one audit note per refund for a human; it never
//! changes a refund's status. Refunds that already carry a note are not
//! selected again. Both phases share one invocation deadline.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use settle_core::Clock;

use crate::batch::{cutoff, BatchExecutor, BatchItem, Deadline, ItemError, Outcome};
use crate::config::{BatchLimits, RefundReconcileConfig};
use crate::error::JobError;
use crate::job::ReconcileJob;
use crate::model::{AuditNote, Refund};
use crate::provider::{PaymentProvider, ProviderRefundStatus, Throttle, TimeoutProvider};
use crate::sinks::{AlertSink, ReconcileAlert};
use crate::store::{AuditNoteStore, RefundStore};

impl BatchItem for Refund {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefundReconcileReport {
    pub found: usize,
    pub completed: usize,
    pub failed: usize,
    pub still_pending: usize,
    pub errors: usize,
    pub has_more: bool,
    /// Phantom refunds without a note yet, selected by phase B.
    pub stale_found: usize,
    /// Phantom refunds that received a new audit note.
    pub stale_alerted: usize,
    pub stale_has_more: bool,
    pub deadline_hit: bool,
}

pub struct RefundReconcileJob {
    refunds: Arc<dyn RefundStore>,
    notes: Arc<dyn AuditNoteStore>,
    provider: TimeoutProvider,
    alerts: Arc<dyn AlertSink>,
    config: RefundReconcileConfig,
    limits: BatchLimits,
    clock: Arc<dyn Clock>,
}

impl RefundReconcileJob {
    pub fn new(
        refunds: Arc<dyn RefundStore>,
        notes: Arc<dyn AuditNoteStore>,
        provider: Arc<dyn PaymentProvider>,
        alerts: Arc<dyn AlertSink>,
        config: RefundReconcileConfig,
        limits: BatchLimits,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            refunds,
            notes,
            provider: TimeoutProvider::new(provider, limits.call_timeout),
            alerts,
            config,
            limits,
            clock,
        }
    }

    fn poll_one(
        &self,
        refund: &Refund,
        throttle: &mut Throttle,
        report: &mut RefundReconcileReport,
    ) -> Result<Outcome, ItemError> {
        let Some(refund_ref) = refund.external_refund_ref.as_deref() else {
            report.errors += 1;
            return Err(ItemError::terminal("refund has no external reference"));
        };

        throttle.wait();
        let upstream = match self.provider.retrieve_refund(refund_ref) {
            Ok(upstream) => upstream,
            Err(err) => {
                report.errors += 1;
                let message = format!("refund {refund_ref}: {err}");
                return Err(if err.is_permanent() {
                    ItemError::terminal(message)
                } else {
                    ItemError::retryable(message)
                });
            }
        };

        let now = self.clock.now();
        match upstream.status {
            ProviderRefundStatus::Succeeded => {
                let changed = self
                    .refunds
                    .complete_if_approved(refund.id, now)
                    .map_err(|e| ItemError::retryable(e.to_string()))?;
                if !changed {
                    return Ok(Outcome::Unchanged);
                }
                report.completed += 1;
                info!(refund_id = %refund.id, refund_ref, "refund completed from provider state");
                Ok(Outcome::Succeeded)
            }
            ProviderRefundStatus::Failed | ProviderRefundStatus::Canceled => {
                let reason = upstream
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| format!("provider reported refund {}", upstream.status.as_str()));
                let changed = self
                    .refunds
                    .fail_if_approved(refund.id, &reason, now)
                    .map_err(|e| ItemError::retryable(e.to_string()))?;
                if !changed {
                    return Ok(Outcome::Unchanged);
                }
                report.failed += 1;
                warn!(refund_id = %refund.id, order_id = %refund.order_id, reason = %reason, "refund failed upstream");
                self.alert(ReconcileAlert::RefundFailed {
                    refund_id: refund.id,
                    order_id: refund.order_id,
                    reason,
                });
                Ok(Outcome::Succeeded)
            }
            ProviderRefundStatus::Pending | ProviderRefundStatus::RequiresAction | ProviderRefundStatus::Other(_) => {
                report.still_pending += 1;
                debug!(refund_id = %refund.id, status = upstream.status.as_str(), "refund still in flight");
                Ok(Outcome::Unchanged)
            }
        }
    }

    fn alert(&self, alert: ReconcileAlert) {
        if let Err(e) = self.alerts.alert(&alert) {
            warn!(error = %e, "could not deliver alert");
        }
    }

    fn note_phantom(&self, refund: &Refund, report: &mut RefundReconcileReport) -> Result<Outcome, ItemError> {
        // Anything with an upstream reference belongs to phase A.
        if !refund.is_phantom() {
            return Ok(Outcome::Unchanged);
        }

        let note = AuditNote::phantom_refund(refund, self.clock.now());
        let added = self
            .notes
            .add_note(note)
            .map_err(|e| ItemError::retryable(e.to_string()))?;
        if !added {
            return Ok(Outcome::Unchanged);
        }

        report.stale_alerted += 1;
        warn!(
            refund_id = %refund.id,
            order_id = %refund.order_id,
            status = ?refund.status,
            created_at = %refund.created_at,
            "phantom refund: recorded but never submitted upstream"
        );
        Ok(Outcome::Succeeded)
    }
}

impl ReconcileJob for RefundReconcileJob {
    type Report = RefundReconcileReport;

    fn name(&self) -> &'static str {
        "refund_reconcile"
    }

    fn run(&self) -> Result<RefundReconcileReport, JobError> {
        let deadline = Deadline::start(self.clock.clone(), self.limits.deadline);
        let mut throttle = Throttle::new(self.clock.clone(), self.limits.inter_call_delay);
        let mut report = RefundReconcileReport::default();
        let now = self.clock.now();

        let processed_before = cutoff(now, self.config.in_flight_cooldown);
        let in_flight = BatchExecutor::new("refund_in_flight", self.config.batch_size).run(
            &deadline,
            |limit| self.refunds.select_in_flight(processed_before, limit),
            |refund| self.poll_one(refund, &mut throttle, &mut report),
        )?;

        let created_before = cutoff(now, self.config.staleness_threshold);
        let phantoms = BatchExecutor::new("refund_phantoms", self.config.batch_size).run(
            &deadline,
            |limit| {
                let noted = self.notes.noted_refunds()?;
                self.refunds.select_phantoms(created_before, &noted, limit)
            },
            |refund| self.note_phantom(refund, &mut report),
        )?;

        report.found = in_flight.found;
        report.has_more = in_flight.has_more;
        report.stale_found = phantoms.found;
        report.stale_has_more = phantoms.has_more;
        report.deadline_hit = in_flight.deadline_hit || phantoms.deadline_hit;

        info!(
            job = self.name(),
            found = report.found,
            completed = report.completed,
            failed = report.failed,
            still_pending = report.still_pending,
            errors = report.errors,
            stale_found = report.stale_found,
            stale_alerted = report.stale_alerted,
            deadline_hit = report.deadline_hit,
            "refund reconciliation finished"
        );
        Ok(report)
    }
}
