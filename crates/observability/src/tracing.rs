//! Tracing/logging initialization.
//!
//! Workers log their lifecycle at `info` and every absorbed transient
//! storage failure at `warn`; under contention that is the signal worth
//! watching, so the default filter keeps `warn` for dependencies and full
//! `info` for this workspace.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// JSON lines with timestamps; override the filter via `RUST_LOG`.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,marketsieve_jobs=info,marketsieve_infra=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
