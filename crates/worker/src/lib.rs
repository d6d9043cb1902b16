//! `settle-worker`: runs one reconciliation job invocation against a JSON
//! state snapshot.
//!
//! The external scheduler calls the binary once per interval. Snapshots make
//! dry runs and incident replays possible without a database.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use settle_core::{Clock, StoreResult};
use settle_reconcile::{
    AuditNote, AuditNoteStore, FailedSideEffect, FollowUps, InMemoryAuditNoteStore, InMemoryOrderStore,
    InMemoryProvider, InMemoryRefundStore, InMemorySideEffectStore, InMemoryWebhookEventStore, Order, OrderStore,
    PaymentSyncJob, PaymentWebhookHandlers, ProviderSnapshot, ReconcileConfig, ReconcileJob, Refund,
    RefundReconcileJob, RefundStore, SideEffectRetryJob, SideEffectStore, TracingAlertSink, WebhookEvent,
    WebhookEventStore, WebhookRetryJob,
};

pub mod collaborators;

use collaborators::{dry_run_registry, LoggingStockRestorer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Webhooks,
    Payments,
    Refunds,
    SideEffects,
}

#[derive(Debug, Error)]
#[error("unknown job {0:?}")]
pub struct UnknownJob(String);

impl std::str::FromStr for JobKind {
    type Err = UnknownJob;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhooks" => Ok(JobKind::Webhooks),
            "payments" => Ok(JobKind::Payments),
            "refunds" => Ok(JobKind::Refunds),
            "side-effects" => Ok(JobKind::SideEffects),
            other => Err(UnknownJob(other.to_string())),
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            JobKind::Webhooks => "webhooks",
            JobKind::Payments => "payments",
            JobKind::Refunds => "refunds",
            JobKind::SideEffects => "side-effects",
        })
    }
}

/// Serialized records plus provider state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub webhook_events: Vec<WebhookEvent>,
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(default)]
    pub refunds: Vec<Refund>,
    #[serde(default)]
    pub side_effects: Vec<FailedSideEffect>,
    #[serde(default)]
    pub audit_notes: Vec<AuditNote>,
    #[serde(default)]
    pub provider: ProviderSnapshot,
}

impl Snapshot {
    pub fn read(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn write(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).with_context(|| format!("writing {}", path.display()))
    }
}

/// In-memory stores hydrated from a [`Snapshot`].
#[derive(Default)]
pub struct Workspace {
    pub events: Arc<InMemoryWebhookEventStore>,
    pub orders: Arc<InMemoryOrderStore>,
    pub refunds: Arc<InMemoryRefundStore>,
    pub side_effects: Arc<InMemorySideEffectStore>,
    pub notes: Arc<InMemoryAuditNoteStore>,
    pub provider: Arc<InMemoryProvider>,
}

impl Workspace {
    pub fn load(snapshot: Snapshot) -> StoreResult<Self> {
        let workspace = Self {
            provider: Arc::new(InMemoryProvider::from_snapshot(snapshot.provider)),
            ..Self::default()
        };
        for event in snapshot.webhook_events {
            workspace.events.insert(event)?;
        }
        for order in snapshot.orders {
            workspace.orders.insert(order)?;
        }
        for refund in snapshot.refunds {
            workspace.refunds.insert(refund)?;
        }
        for effect in snapshot.side_effects {
            workspace.side_effects.enqueue(effect)?;
        }
        for note in snapshot.audit_notes {
            workspace.notes.add_note(note)?;
        }
        Ok(workspace)
    }

    pub fn snapshot(&self) -> StoreResult<Snapshot> {
        Ok(Snapshot {
            webhook_events: self.events.all()?,
            orders: self.orders.all()?,
            refunds: self.refunds.all()?,
            side_effects: self.side_effects.all()?,
            audit_notes: self.notes.all()?,
            provider: self.provider.snapshot(),
        })
    }
}

/// Run one invocation of `kind` and return its report as JSON.
pub fn run(
    kind: JobKind,
    workspace: &Workspace,
    config: &ReconcileConfig,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<serde_json::Value> {
    let limits = config.limits.clone();
    match kind {
        JobKind::Webhooks => {
            let registry = Arc::new(dry_run_registry());
            let handlers = PaymentWebhookHandlers::new(
                workspace.orders.clone(),
                workspace.refunds.clone(),
                Arc::new(LoggingStockRestorer),
                clock.clone(),
            );
            execute(WebhookRetryJob::new(
                workspace.events.clone(),
                workspace.provider.clone(),
                Arc::new(handlers),
                FollowUps::new(registry, workspace.side_effects.clone()),
                config.webhooks.clone(),
                limits,
                clock,
            ))
        }
        JobKind::Payments => execute(PaymentSyncJob::new(
            workspace.orders.clone(),
            workspace.provider.clone(),
            Arc::new(LoggingStockRestorer),
            Arc::new(TracingAlertSink),
            config.payments.clone(),
            limits,
            clock,
        )),
        JobKind::Refunds => execute(RefundReconcileJob::new(
            workspace.refunds.clone(),
            workspace.notes.clone(),
            workspace.provider.clone(),
            Arc::new(TracingAlertSink),
            config.refunds.clone(),
            limits,
            clock,
        )),
        JobKind::SideEffects => execute(SideEffectRetryJob::new(
            workspace.side_effects.clone(),
            Arc::new(dry_run_registry()),
            config.side_effects.clone(),
            limits,
            clock,
        )),
    }
}

fn execute<J: ReconcileJob>(job: J) -> anyhow::Result<serde_json::Value> {
    tracing::info!(job = job.name(), "invocation started");
    let report = job.run().with_context(|| format!("{} aborted", job.name()))?;
    Ok(serde_json::to_value(report)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use settle_core::ManualClock;
    use settle_reconcile::{IntentStatus, PaymentIntent, PaymentStatus, SideEffectStatus, TaskKind};

    #[test]
    fn job_names_parse() {
        for name in ["webhooks", "payments", "refunds", "side-effects"] {
            let kind: JobKind = name.parse().unwrap();
            assert_eq!(kind.to_string(), name);
        }
        assert!("cleanup".parse::<JobKind>().is_err());
    }

    #[test]
    fn payment_sync_updates_the_snapshot() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let order = Order::pending("pi_1", clock.now() - ChronoDuration::hours(2));
        let mut snapshot = Snapshot {
            orders: vec![order.clone()],
            ..Snapshot::default()
        };
        snapshot
            .provider
            .payment_intents
            .push(PaymentIntent::new("pi_1", IntentStatus::Succeeded));

        let workspace = Workspace::load(snapshot).unwrap();
        let report = run(JobKind::Payments, &workspace, &ReconcileConfig::default(), clock).unwrap();

        assert_eq!(report["paid"].as_u64(), Some(1));
        let after = workspace.snapshot().unwrap();
        assert_eq!(after.orders[0].payment_status, PaymentStatus::Paid);
    }

    #[test]
    fn dry_run_side_effects_succeed() {
        let snapshot = Snapshot {
            side_effects: vec![FailedSideEffect::new(
                TaskKind::PaymentFailedEmail,
                serde_json::json!({}),
                "buyer@example.com",
                "smtp timeout",
                Utc::now(),
            )],
            ..Snapshot::default()
        };

        let workspace = Workspace::load(snapshot).unwrap();
        let report = run(
            JobKind::SideEffects,
            &workspace,
            &ReconcileConfig::default(),
            Arc::new(ManualClock::default()),
        )
        .unwrap();

        assert_eq!(report["succeeded"].as_u64(), Some(1));
        assert_eq!(workspace.snapshot().unwrap().side_effects[0].status, SideEffectStatus::Retried);
    }

    #[test]
    fn snapshot_survives_a_file_round_trip() {
        let path = std::env::temp_dir().join(format!("settle-worker-{}.json", settle_core::OrderId::new()));
        let snapshot = Snapshot {
            orders: vec![Order::pending("pi_9", Utc::now())],
            ..Snapshot::default()
        };

        snapshot.write(&path).unwrap();
        let restored = Snapshot::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(restored, snapshot);
    }
}
