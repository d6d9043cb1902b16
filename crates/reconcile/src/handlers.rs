//! Standard payment webhook dispatch table.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use settle_core::Clock;

use crate::model::{EventKind, Order, TaskKind};
use crate::provider::{ProviderEvent, ProviderRefundStatus};
use crate::sinks::StockRestorer;
use crate::store::{OrderStore, RefundStore};
use crate::webhooks::{DispatchError, FollowUpTask, WebhookDispatcher};

/// Destination of operator-facing follow-up tasks.
pub const OPERATIONS_DESTINATION: &str = "operations";

/// Applies payment and refund events to orders and refunds.
///
/// Every transition is a compare-and-set, so dispatching the same event twice
/// finds nothing to change the second time and returns no follow-up tasks.
pub struct PaymentWebhookHandlers {
    orders: Arc<dyn OrderStore>,
    refunds: Arc<dyn RefundStore>,
    stock: Arc<dyn StockRestorer>,
    clock: Arc<dyn Clock>,
}

impl PaymentWebhookHandlers {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        refunds: Arc<dyn RefundStore>,
        stock: Arc<dyn StockRestorer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orders,
            refunds,
            stock,
            clock,
        }
    }

    fn order_for(&self, event: &ProviderEvent) -> Result<Order, DispatchError> {
        self.orders
            .find_by_payment_ref(&event.object_id)?
            .ok_or_else(|| DispatchError::NotFound(format!("order for payment {}", event.object_id)))
    }

    fn payment_succeeded(&self, event: &ProviderEvent) -> Result<Vec<FollowUpTask>, DispatchError> {
        let order = self.order_for(event)?;
        if !self.orders.mark_paid_if_pending(order.id)? {
            debug!(order_id = %order.id, "order already resolved; nothing to apply");
            return Ok(Vec::new());
        }

        Ok(email(&order, TaskKind::OrderConfirmationEmail).into_iter().collect())
    }

    fn payment_failed(&self, event: &ProviderEvent) -> Result<Vec<FollowUpTask>, DispatchError> {
        let order = self.order_for(event)?;
        if !self.orders.mark_failed_if_pending(order.id)? {
            debug!(order_id = %order.id, "order already resolved; nothing to apply");
            return Ok(Vec::new());
        }

        if let Err(error) = self.stock.restore_stock(order.id) {
            warn!(order_id = %order.id, error = %error, "stock restoration failed after payment failure");
        }

        Ok(email(&order, TaskKind::PaymentFailedEmail).into_iter().collect())
    }

    fn refund_changed(&self, event: &ProviderEvent) -> Result<Vec<FollowUpTask>, DispatchError> {
        // charge.refunded is about the charge; the refund is named in the payload.
        let (refund_ref, default_status) = match event.kind {
            EventKind::ChargeRefunded => (event.data_str("refund").unwrap_or(event.object_id.as_str()), "succeeded"),
            _ => (event.object_id.as_str(), ""),
        };
        let status = ProviderRefundStatus::parse(event.data_str("status").unwrap_or(default_status));

        let refund = self
            .refunds
            .find_by_external_ref(refund_ref)?
            .ok_or_else(|| DispatchError::NotFound(format!("refund {refund_ref}")))?;
        let now = self.clock.now();

        match status {
            ProviderRefundStatus::Succeeded => {
                if !self.refunds.complete_if_approved(refund.id, now)? {
                    return Ok(Vec::new());
                }
                let order = self.orders.get(refund.order_id)?;
                Ok(order
                    .and_then(|order| email(&order, TaskKind::RefundProcessedEmail))
                    .into_iter()
                    .collect())
            }
            ProviderRefundStatus::Failed | ProviderRefundStatus::Canceled => {
                let reason = event
                    .data_str("failure_reason")
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("provider reported refund {}", status.as_str()));
                if !self.refunds.fail_if_approved(refund.id, &reason, now)? {
                    return Ok(Vec::new());
                }
                Ok(vec![FollowUpTask::new(
                    TaskKind::RefundFailedAlert,
                    json!({ "refund_id": refund.id, "order_id": refund.order_id, "reason": reason }),
                    OPERATIONS_DESTINATION,
                )])
            }
            ProviderRefundStatus::Pending | ProviderRefundStatus::RequiresAction | ProviderRefundStatus::Other(_) => {
                debug!(refund_id = %refund.id, status = status.as_str(), "refund still in flight");
                Ok(Vec::new())
            }
        }
    }
}

fn email(order: &Order, kind: TaskKind) -> Option<FollowUpTask> {
    let to = order.customer_email.as_deref()?;
    Some(FollowUpTask::new(kind, json!({ "order_id": order.id }), to))
}

impl WebhookDispatcher for PaymentWebhookHandlers {
    fn supports(&self, kind: &EventKind) -> bool {
        match kind {
            EventKind::PaymentIntentSucceeded
            | EventKind::PaymentIntentPaymentFailed
            | EventKind::PaymentIntentCanceled
            | EventKind::ChargeRefunded
            | EventKind::RefundUpdated => true,
            EventKind::Other(_) => false,
        }
    }

    fn dispatch(&self, event: &ProviderEvent) -> Result<Vec<FollowUpTask>, DispatchError> {
        match &event.kind {
            EventKind::PaymentIntentSucceeded => self.payment_succeeded(event),
            EventKind::PaymentIntentPaymentFailed | EventKind::PaymentIntentCanceled => self.payment_failed(event),
            EventKind::ChargeRefunded | EventKind::RefundUpdated => self.refund_changed(event),
            EventKind::Other(_) => Err(DispatchError::Unsupported(event.kind.clone())),
        }
    }
}
