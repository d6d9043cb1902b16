//! Tracing and logging setup shared by the reconciliation binaries.

/// Initialize process-wide logging.
///
/// JSON lines unless `SETTLE_LOG_FORMAT=pretty`. This is safe to call multiple
/// times; subsequent calls become no-ops.
pub fn init() {
    let format = std::env::var("SETTLE_LOG_FORMAT")
        .map(|name| LogFormat::from_name(&name))
        .unwrap_or_default();
    tracing::init(format);
}

/// Tracing configuration (filters, formatters).
pub mod tracing;

pub use tracing::LogFormat;
