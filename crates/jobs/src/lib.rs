//! `marketsieve-jobs` — background job orchestration.
//!
//! **Responsibility:** run client-submitted screening batches off the request
//! path: admit jobs (coalescing duplicate submissions onto the in-flight
//! job), drive each job with a single executor task that tolerates
//! per-target failures, persist results idempotently, and serve progress to
//! pollers.
//!
//! This crate is storage- and evaluator-agnostic:
//! - storage is reached only through the [`store::JobStore`] and
//!   [`store::ResultStore`] ports (an in-memory implementation for
//!   tests/dev lives in [`memory`]; the Postgres adapter lives in
//!   `marketsieve-infra`);
//! - scoring is reached only through the [`evaluator::Evaluator`] port.
//!
//! The shared store is lock-based and may transiently reject concurrent
//! writes. Correctness here rests on two rules, not on any global lock:
//! every individual write is wrapped in its own bounded retry
//! ([`retry::with_retry`]), and each job's row is written by exactly one
//! executor task for the job's whole lifetime.

pub mod config;
pub mod creator;
pub mod dedupe;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod job;
pub mod memory;
pub mod progress;
pub mod retry;
pub mod service;
pub mod store;

pub use config::JobsConfig;
pub use creator::{JobCreator, JobTicket};
pub use dedupe::DuplicateGuard;
pub use error::JobError;
pub use evaluator::{Evaluation, Evaluator, EvaluatorError};
pub use executor::JobExecutor;
pub use job::{JobRecord, JobState, TargetError};
pub use memory::{InMemoryJobStore, InMemoryResultStore};
pub use progress::{JobProgress, JobStatus, ProgressAggregator};
pub use retry::{with_retry, RetryPolicy};
pub use service::JobService;
pub use store::{
    JobStore, OutcomeClass, ProgressDelta, ResultStore, StorageError, TargetResult,
};
