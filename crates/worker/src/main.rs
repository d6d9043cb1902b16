use std::sync::Arc;

use anyhow::Context;

use settle_core::SystemClock;
use settle_reconcile::ReconcileConfig;
use settle_worker::{JobKind, Snapshot, Workspace};

const USAGE: &str = "usage: settle-worker <webhooks|payments|refunds|side-effects> <snapshot.json>";

fn main() -> anyhow::Result<()> {
    settle_observability::init();

    let mut args = std::env::args().skip(1);
    let (Some(job), Some(path)) = (args.next(), args.next()) else {
        anyhow::bail!(USAGE);
    };
    let kind: JobKind = job.parse().context(USAGE)?;

    let config = ReconcileConfig::from_env().context("loading configuration")?;
    let workspace = Workspace::load(Snapshot::read(&path)?)?;

    let report = settle_worker::run(kind, &workspace, &config, Arc::new(SystemClock)).inspect_err(|e| {
        tracing::error!(job = %kind, error = %e, "invocation aborted");
    })?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    workspace.snapshot()?.write(&path)?;
    Ok(())
}
