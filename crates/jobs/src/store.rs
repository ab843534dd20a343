//! Storage ports: the job registry and the result store.
//!
//! The backing engine is shared and lock-based: under contention a write can
//! be transiently rejected instead of blocking forever. The taxonomy below
//! keeps that case distinguishable — [`StorageError::is_transient`] is the
//! single predicate the retry combinator consults.
//!
//! Operations are deliberately fine-grained (one row, one concern) so every
//! individual write carries its own retry scope. A coarse "save the whole
//! job" operation would conflate "this one write is contended" with "this
//! entire job must be abandoned".

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;

use marketsieve_core::{Fingerprint, JobId, PayloadId, Symbol};

use crate::job::{JobRecord, JobState, TargetError};

/// Storage operation error.
///
/// `Busy` and `Connection` are transient (contention, pool hiccups) and are
/// absorbed by the retry combinator; the rest are permanent for the
/// attempted operation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Lock/contention timeout on a read or write; expected to succeed on retry.
    #[error("storage busy: {0}")]
    Busy(String),

    /// Connection-level failure (pool exhausted/closed, transport error).
    #[error("storage connection failed: {0}")]
    Connection(String),

    /// The addressed row does not exist.
    #[error("record not found: {0}")]
    NotFound(String),

    /// The write contradicts current row state (terminal job, duplicate id).
    #[error("storage conflict: {0}")]
    Conflict(String),

    /// Stored data failed to decode.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Any other backend failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Connection(_))
    }
}

/// One target's worth of progress, applied atomically to the job row.
#[derive(Debug, Clone, Default)]
pub struct ProgressDelta {
    pub completed: u32,
    pub succeeded: u32,
    pub error: Option<TargetError>,
}

impl ProgressDelta {
    pub fn succeeded() -> Self {
        Self {
            completed: 1,
            succeeded: 1,
            error: None,
        }
    }

    pub fn failed(symbol: Symbol, message: impl Into<String>) -> Self {
        Self {
            completed: 1,
            succeeded: 0,
            error: Some(TargetError {
                symbol,
                message: message.into(),
            }),
        }
    }
}

/// Outcome classification of one evaluated target, used by list/filter
/// queries without touching the full payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    Bullish,
    Bearish,
    Neutral,
    Inconclusive,
}

impl OutcomeClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bullish => "bullish",
            Self::Bearish => "bearish",
            Self::Neutral => "neutral",
            Self::Inconclusive => "inconclusive",
        }
    }
}

impl core::str::FromStr for OutcomeClass {
    type Err = marketsieve_core::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bullish" => Ok(Self::Bullish),
            "bearish" => Ok(Self::Bearish),
            "neutral" => Ok(Self::Neutral),
            "inconclusive" => Ok(Self::Inconclusive),
            other => Err(marketsieve_core::DomainError::invalid_id(format!(
                "OutcomeClass: {other:?}"
            ))),
        }
    }
}

/// Summary row for one evaluated target.
///
/// The large evaluation payload lives behind `payload_ref` in separate
/// storage — list reads never drag it along. Rows are append-only: a later
/// write for the same `(symbol, as_of)` is the new current one; stale rows
/// may coexist and readers always take the most recent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResult {
    /// Which job produced this row (attribution, not ownership).
    pub job_id: JobId,
    pub symbol: Symbol,
    /// Calendar day the evaluation is for; `(symbol, as_of)` is the
    /// idempotency key.
    pub as_of: NaiveDate,
    pub outcome: OutcomeClass,
    pub score: f64,
    pub label: String,
    pub payload_ref: PayloadId,
    pub created_at: DateTime<Utc>,
}

/// Durable registry of job rows.
///
/// Implementations must:
/// - enforce monotonic state transitions (a terminal job rejects writes,
///   except an idempotent repeat of the same terminal state);
/// - enforce `completed <= total` and `succeeded <= completed`;
/// - fold the `Queued → Processing` promotion into `record_progress`, so a
///   lost status flip is repaired by the next progress write;
/// - report lock/contention timeouts as [`StorageError::Busy`].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a freshly admitted job row. Duplicate `job_id` is a conflict.
    async fn insert_job(&self, job: &JobRecord) -> Result<(), StorageError>;

    /// Fetch one job row, `None` if unknown.
    async fn fetch_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StorageError>;

    /// Flip `Queued → Processing` and stamp `started_at`. Idempotent when
    /// already processing.
    async fn mark_processing(
        &self,
        job_id: JobId,
        started_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Apply one target's progress to the job row.
    async fn record_progress(
        &self,
        job_id: JobId,
        delta: ProgressDelta,
    ) -> Result<(), StorageError>;

    /// Move the job to a terminal state and stamp `completed_at`.
    async fn mark_terminal(
        &self,
        job_id: JobId,
        state: JobState,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Most recent active (queued/processing) job with this fingerprint
    /// created at or after `created_after`, if any.
    async fn find_active_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        created_after: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, StorageError>;

    /// All active jobs, most recent first.
    async fn active_jobs(&self) -> Result<Vec<JobRecord>, StorageError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert_job(&self, job: &JobRecord) -> Result<(), StorageError> {
        (**self).insert_job(job).await
    }

    async fn fetch_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StorageError> {
        (**self).fetch_job(job_id).await
    }

    async fn mark_processing(
        &self,
        job_id: JobId,
        started_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        (**self).mark_processing(job_id, started_at).await
    }

    async fn record_progress(
        &self,
        job_id: JobId,
        delta: ProgressDelta,
    ) -> Result<(), StorageError> {
        (**self).record_progress(job_id, delta).await
    }

    async fn mark_terminal(
        &self,
        job_id: JobId,
        state: JobState,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        (**self).mark_terminal(job_id, state, completed_at).await
    }

    async fn find_active_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        created_after: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, StorageError> {
        (**self)
            .find_active_by_fingerprint(fingerprint, created_after)
            .await
    }

    async fn active_jobs(&self) -> Result<Vec<JobRecord>, StorageError> {
        (**self).active_jobs().await
    }
}

/// Append-only store of per-target results plus their detached payloads.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Append a new current row for `(symbol, as_of)` and store its payload
    /// under `result.payload_ref`. Never mutates prior rows.
    async fn put(&self, result: &TargetResult, payload: &JsonValue) -> Result<(), StorageError>;

    /// The current (most recent) row for `(symbol, as_of)`, if any.
    async fn latest_for(
        &self,
        symbol: &Symbol,
        as_of: NaiveDate,
    ) -> Result<Option<TargetResult>, StorageError>;

    /// Summary rows attributed to one job, in write order. Payloads are not
    /// fetched.
    async fn for_job(&self, job_id: JobId) -> Result<Vec<TargetResult>, StorageError>;

    /// Lazily fetch one detached payload.
    async fn payload(&self, payload_ref: PayloadId) -> Result<Option<JsonValue>, StorageError>;
}

#[async_trait]
impl<S> ResultStore for Arc<S>
where
    S: ResultStore + ?Sized,
{
    async fn put(&self, result: &TargetResult, payload: &JsonValue) -> Result<(), StorageError> {
        (**self).put(result, payload).await
    }

    async fn latest_for(
        &self,
        symbol: &Symbol,
        as_of: NaiveDate,
    ) -> Result<Option<TargetResult>, StorageError> {
        (**self).latest_for(symbol, as_of).await
    }

    async fn for_job(&self, job_id: JobId) -> Result<Vec<TargetResult>, StorageError> {
        (**self).for_job(job_id).await
    }

    async fn payload(&self, payload_ref: PayloadId) -> Result<Option<JsonValue>, StorageError> {
        (**self).payload(payload_ref).await
    }
}
