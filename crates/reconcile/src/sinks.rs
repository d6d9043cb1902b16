//! Compensating actions and operator alerts.
//!
//! Both are secondary effects: their failures are logged and counted by the
//! calling job but never roll back the primary state change.

use std::sync::Mutex;

use serde::Serialize;

use settle_core::{OrderId, RefundId};

/// Restores inventory that was optimistically decremented when an order was placed.
pub trait StockRestorer: Send + Sync {
    fn restore_stock(&self, order_id: OrderId) -> Result<(), String>;
}

/// Something an operator should look at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconcileAlert {
    RefundFailed {
        refund_id: RefundId,
        order_id: OrderId,
        reason: String,
    },
    StockRestoreFailed {
        order_id: OrderId,
        error: String,
    },
}

/// Best-effort alert delivery.
pub trait AlertSink: Send + Sync {
    fn alert(&self, alert: &ReconcileAlert) -> Result<(), String>;
}

/// Stock restorer that records calls, for tests/dev.
#[derive(Debug, Default)]
pub struct RecordingStockRestorer {
    calls: Mutex<Vec<OrderId>>,
    failure: Option<String>,
}

impl RecordingStockRestorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call is recorded, then fails with `error`.
    pub fn failing(error: impl Into<String>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failure: Some(error.into()),
        }
    }

    pub fn calls(&self) -> Vec<OrderId> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl StockRestorer for RecordingStockRestorer {
    fn restore_stock(&self, order_id: OrderId) -> Result<(), String> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(order_id);
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Alert sink that keeps alerts in memory, for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAlertSink {
    inner: Mutex<Vec<ReconcileAlert>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<ReconcileAlert> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl AlertSink for InMemoryAlertSink {
    fn alert(&self, alert: &ReconcileAlert) -> Result<(), String> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).push(alert.clone());
        Ok(())
    }
}

/// Alert sink that only logs.
#[derive(Debug, Default, Copy, Clone)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, alert: &ReconcileAlert) -> Result<(), String> {
        let body = serde_json::to_string(alert).map_err(|e| e.to_string())?;
        tracing::warn!(alert = %body, "reconciliation alert");
        Ok(())
    }
}
