//! Collaborators for dry runs: they log what they would do and succeed.

use tracing::info;

use settle_core::OrderId;
use settle_reconcile::{SideEffectRegistry, StockRestorer, TaskKind};

#[derive(Debug, Default, Copy, Clone)]
pub struct LoggingStockRestorer;

impl StockRestorer for LoggingStockRestorer {
    fn restore_stock(&self, order_id: OrderId) -> Result<(), String> {
        info!(order_id = %order_id, "dry run: would restore stock");
        Ok(())
    }
}

/// A registry with a logging handler for every known task kind.
pub fn dry_run_registry() -> SideEffectRegistry {
    let mut registry = SideEffectRegistry::new();
    for kind in TaskKind::known() {
        let name = kind.to_string();
        registry.register(kind, move |payload, destination| {
            info!(kind = %name, destination, payload = %payload, "dry run: would send");
            Ok(())
        });
    }
    registry
}
