//! Infrastructure layer: storage adapters for the job subsystem.
//!
//! The in-memory stores used by tests/dev live in `marketsieve-jobs`
//! (`memory` module); this crate adds the production Postgres adapters.

pub mod job_store;

#[cfg(test)]
mod integration_tests;

pub use job_store::{connect_pool, ensure_schema, PostgresJobStore, PostgresResultStore};
