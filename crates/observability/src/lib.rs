//! `marketsieve-observability` — process-level telemetry setup.

pub mod tracing;

pub use tracing::init;
