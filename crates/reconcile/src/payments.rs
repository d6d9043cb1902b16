//! Payment sync: resolve orders stuck in `PENDING` by polling the provider.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use settle_core::Clock;

use crate::batch::{cutoff, BatchExecutor, BatchItem, Deadline, ItemError, Outcome};
use crate::config::{BatchLimits, PaymentSyncConfig};
use crate::error::JobError;
use crate::job::ReconcileJob;
use crate::model::Order;
use crate::provider::{IntentStatus, PaymentProvider, ProviderError, Throttle, TimeoutProvider};
use crate::sinks::{AlertSink, ReconcileAlert, StockRestorer};
use crate::store::OrderStore;

impl BatchItem for Order {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PaymentSyncReport {
    pub found: usize,
    /// Orders whose payment status changed this run.
    pub updated: usize,
    pub paid: usize,
    pub failed: usize,
    pub still_pending: usize,
    /// Provider or store errors.
    pub errors: usize,
    /// Compensations that failed after an order was marked `FAILED`.
    pub stock_restore_failures: usize,
    pub has_more: bool,
    pub deadline_hit: bool,
}

pub struct PaymentSyncJob {
    orders: Arc<dyn OrderStore>,
    provider: TimeoutProvider,
    stock: Arc<dyn StockRestorer>,
    alerts: Arc<dyn AlertSink>,
    config: PaymentSyncConfig,
    limits: BatchLimits,
    clock: Arc<dyn Clock>,
}

impl PaymentSyncJob {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        provider: Arc<dyn PaymentProvider>,
        stock: Arc<dyn StockRestorer>,
        alerts: Arc<dyn AlertSink>,
        config: PaymentSyncConfig,
        limits: BatchLimits,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orders,
            provider: TimeoutProvider::new(provider, limits.call_timeout),
            stock,
            alerts,
            config,
            limits,
            clock,
        }
    }

    fn sync_one(&self, order: &Order, throttle: &mut Throttle, report: &mut PaymentSyncReport) -> Result<Outcome, ItemError> {
        let Some(payment_ref) = order.external_payment_ref.as_deref() else {
            report.errors += 1;
            return Err(ItemError::terminal("order has no external payment reference"));
        };

        throttle.wait();
        let intent = match self.provider.retrieve_payment_intent(payment_ref) {
            Ok(intent) => intent,
            Err(err) => {
                report.errors += 1;
                return Err(match err {
                    ProviderError::NotFound(_) => ItemError::terminal(format!("payment {payment_ref}: {err}")),
                    _ => ItemError::retryable(format!("payment {payment_ref}: {err}")),
                });
            }
        };

        let store_err = |e: settle_core::StoreError| ItemError::retryable(e.to_string());

        if intent.status == IntentStatus::Succeeded {
            if !self.orders.mark_paid_if_pending(order.id).map_err(store_err)? {
                debug!(order_id = %order.id, "order already resolved");
                return Ok(Outcome::Unchanged);
            }
            report.updated += 1;
            report.paid += 1;
            info!(order_id = %order.id, payment_ref, "order marked paid from provider state");
            return Ok(Outcome::Succeeded);
        }

        if intent.status.is_failed() {
            if !self.orders.mark_failed_if_pending(order.id).map_err(store_err)? {
                debug!(order_id = %order.id, "order already resolved");
                return Ok(Outcome::Unchanged);
            }
            report.updated += 1;
            report.failed += 1;
            info!(order_id = %order.id, payment_ref, status = intent.status.as_str(), "order marked failed from provider state");
            self.restore_stock(order, report);
            return Ok(Outcome::Succeeded);
        }

        report.still_pending += 1;
        debug!(order_id = %order.id, status = intent.status.as_str(), "payment still in flight");
        Ok(Outcome::Unchanged)
    }

    /// Never reverts the `FAILED` transition.
    fn restore_stock(&self, order: &Order, report: &mut PaymentSyncReport) {
        let Err(error) = self.stock.restore_stock(order.id) else {
            return;
        };

        report.stock_restore_failures += 1;
        warn!(order_id = %order.id, error = %error, "stock restoration failed; payment state kept");
        let alert = ReconcileAlert::StockRestoreFailed {
            order_id: order.id,
            error,
        };
        if let Err(e) = self.alerts.alert(&alert) {
            warn!(order_id = %order.id, error = %e, "could not deliver alert");
        }
    }
}

impl ReconcileJob for PaymentSyncJob {
    type Report = PaymentSyncReport;

    fn name(&self) -> &'static str {
        "payment_sync"
    }

    fn run(&self) -> Result<PaymentSyncReport, JobError> {
        let deadline = Deadline::start(self.clock.clone(), self.limits.deadline);
        let executor = BatchExecutor::new(self.name(), self.config.batch_size);
        let mut throttle = Throttle::new(self.clock.clone(), self.limits.inter_call_delay);
        let mut report = PaymentSyncReport::default();

        let now = self.clock.now();
        let created_from = cutoff(now, self.config.max_age);
        let created_to = cutoff(now, self.config.min_age);

        let summary = executor.run(
            &deadline,
            |limit| self.orders.select_pending_payments(created_from, created_to, limit),
            |order| self.sync_one(order, &mut throttle, &mut report),
        )?;

        report.found = summary.found;
        report.has_more = summary.has_more;
        report.deadline_hit = summary.deadline_hit;

        info!(
            job = self.name(),
            found = report.found,
            paid = report.paid,
            failed = report.failed,
            still_pending = report.still_pending,
            errors = report.errors,
            stock_restore_failures = report.stock_restore_failures,
            has_more = report.has_more,
            "payment sync finished"
        );
        Ok(report)
    }
}
