//! Storage adapters for the job registry and result store.

mod postgres;

pub use postgres::{connect_pool, ensure_schema, PostgresJobStore, PostgresResultStore};
