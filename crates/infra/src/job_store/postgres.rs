//! Postgres-backed job registry and result store.
//!
//! ## Contention Behavior
//!
//! The shared engine is lock-based: concurrent writers contend on row
//! locks. Every pooled connection runs with a bounded `lock_timeout`
//! (see [`connect_pool`]) so a contended write **blocks for a few seconds**
//! and then fails with `lock_not_available` — it neither fails instantly
//! nor hangs forever. That timeout is what surfaces as
//! [`StorageError::Busy`] and is absorbed by the caller's retry scope.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StorageError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StorageError | Scenario |
//! |------------|----------------------|--------------|----------|
//! | Database | `55P03` (lock_not_available) | `Busy` | Lock timeout on a contended row |
//! | Database | `40001` (serialization_failure) | `Busy` | Concurrent transaction conflict |
//! | Database | `40P01` (deadlock_detected) | `Busy` | Deadlock victim; retry wins |
//! | Database | `23505` (unique violation) | `Conflict` | Duplicate job_id insert |
//! | Database | Any other | `Backend` | Constraint/data errors |
//! | PoolTimedOut | N/A | `Busy` | All pooled connections in use |
//! | PoolClosed | N/A | `Connection` | Pool shut down |
//! | Io | N/A | `Connection` | Transport failure |
//! | RowNotFound | N/A | `NotFound` | Addressed row missing |
//! | Other | N/A | `Backend` | Decode errors etc. |
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     job_id       UUID PRIMARY KEY,
//!     state        TEXT NOT NULL,
//!     fingerprint  TEXT NOT NULL,
//!     total        INTEGER NOT NULL,
//!     completed    INTEGER NOT NULL DEFAULT 0,
//!     succeeded    INTEGER NOT NULL DEFAULT 0,
//!     errors       JSONB NOT NULL DEFAULT '[]'::jsonb,
//!     created_at   TIMESTAMPTZ NOT NULL,
//!     started_at   TIMESTAMPTZ,
//!     completed_at TIMESTAMPTZ
//! );
//! CREATE INDEX jobs_fingerprint_idx ON jobs (fingerprint, created_at DESC);
//!
//! CREATE TABLE target_results (
//!     id          BIGSERIAL PRIMARY KEY,
//!     job_id      UUID NOT NULL,
//!     symbol      TEXT NOT NULL,
//!     as_of       DATE NOT NULL,
//!     outcome     TEXT NOT NULL,
//!     score       DOUBLE PRECISION NOT NULL,
//!     label       TEXT NOT NULL,
//!     payload_ref UUID NOT NULL,
//!     created_at  TIMESTAMPTZ NOT NULL
//! );
//! CREATE INDEX target_results_key_idx ON target_results (symbol, as_of, id DESC);
//! CREATE INDEX target_results_job_idx ON target_results (job_id);
//!
//! CREATE TABLE result_payloads (
//!     payload_ref UUID PRIMARY KEY,
//!     payload     JSONB NOT NULL,
//!     created_at  TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! Result rows are append-only: a repeat write for `(symbol, as_of)` adds a
//! new row that supersedes the prior one logically; readers take the
//! highest `id`. The opaque payload lives in `result_payloads`, off the
//! hot list-query path, fetched only by `payload()`.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use marketsieve_core::{Fingerprint, JobId, PayloadId, Symbol};
use marketsieve_jobs::{
    JobRecord, JobState, JobStore, OutcomeClass, ProgressDelta, ResultStore, StorageError,
    TargetResult,
};

/// Build a pool whose connections block bounded on contended locks.
///
/// `lock_timeout` makes a contended write wait a few seconds before
/// surfacing `55P03`, which keeps most contention below the retry ceiling
/// instead of burning attempts on instant failures.
pub async fn connect_pool(database_url: &str) -> Result<PgPool, StorageError> {
    PgPoolOptions::new()
        .max_connections(10)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("SET lock_timeout = '5s'").await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
        .map_err(|e| StorageError::Connection(format!("connect: {e}")))
}

/// Create the tables and indexes if they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StorageError> {
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            job_id       UUID PRIMARY KEY,
            state        TEXT NOT NULL,
            fingerprint  TEXT NOT NULL,
            total        INTEGER NOT NULL,
            completed    INTEGER NOT NULL DEFAULT 0,
            succeeded    INTEGER NOT NULL DEFAULT 0,
            errors       JSONB NOT NULL DEFAULT '[]'::jsonb,
            created_at   TIMESTAMPTZ NOT NULL,
            started_at   TIMESTAMPTZ,
            completed_at TIMESTAMPTZ
        );
        CREATE INDEX IF NOT EXISTS jobs_fingerprint_idx
            ON jobs (fingerprint, created_at DESC);

        CREATE TABLE IF NOT EXISTS target_results (
            id          BIGSERIAL PRIMARY KEY,
            job_id      UUID NOT NULL,
            symbol      TEXT NOT NULL,
            as_of       DATE NOT NULL,
            outcome     TEXT NOT NULL,
            score       DOUBLE PRECISION NOT NULL,
            label       TEXT NOT NULL,
            payload_ref UUID NOT NULL,
            created_at  TIMESTAMPTZ NOT NULL
        );
        CREATE INDEX IF NOT EXISTS target_results_key_idx
            ON target_results (symbol, as_of, id DESC);
        CREATE INDEX IF NOT EXISTS target_results_job_idx
            ON target_results (job_id);

        CREATE TABLE IF NOT EXISTS result_payloads (
            payload_ref UUID PRIMARY KEY,
            payload     JSONB NOT NULL,
            created_at  TIMESTAMPTZ NOT NULL
        );
        "#,
    )
    .await
    .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    Ok(())
}

fn map_sqlx_error(op: &str, e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("55P03") | Some("40001") | Some("40P01") => {
                StorageError::Busy(format!("{op}: {}", db.message()))
            }
            Some("23505") => StorageError::Conflict(format!("{op}: {}", db.message())),
            _ => StorageError::Backend(format!("{op}: {}", db.message())),
        },
        sqlx::Error::PoolTimedOut => StorageError::Busy(format!("{op}: connection pool timed out")),
        sqlx::Error::PoolClosed => StorageError::Connection(format!("{op}: pool closed")),
        sqlx::Error::Io(io) => StorageError::Connection(format!("{op}: {io}")),
        sqlx::Error::RowNotFound => StorageError::NotFound(op.to_string()),
        _ => StorageError::Backend(format!("{op}: {e}")),
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    job_id: Uuid,
    state: String,
    fingerprint: String,
    total: i32,
    completed: i32,
    succeeded: i32,
    errors: JsonValue,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StorageError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = JobState::from_str(&row.state)
            .map_err(|e| StorageError::Corrupt(format!("job {}: {e}", row.job_id)))?;
        let errors = serde_json::from_value(row.errors)
            .map_err(|e| StorageError::Corrupt(format!("job {} errors: {e}", row.job_id)))?;
        Ok(JobRecord {
            job_id: JobId::from_uuid(row.job_id),
            state,
            fingerprint: Fingerprint::from_storage(row.fingerprint),
            total: row.total as u32,
            completed: row.completed as u32,
            succeeded: row.succeeded as u32,
            errors,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

const JOB_COLUMNS: &str = "job_id, state, fingerprint, total, completed, succeeded, errors, \
                           created_at, started_at, completed_at";

/// Postgres-backed job registry.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn current_state(&self, op: &str, job_id: Uuid) -> Result<Option<JobState>, StorageError> {
        let row = sqlx::query("SELECT state FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(op, e))?;
        match row {
            None => Ok(None),
            Some(row) => {
                let state: String = row
                    .try_get("state")
                    .map_err(|e| map_sqlx_error(op, e))?;
                let state = JobState::from_str(&state)
                    .map_err(|e| StorageError::Corrupt(format!("job {job_id}: {e}")))?;
                Ok(Some(state))
            }
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.job_id), err)]
    async fn insert_job(&self, job: &JobRecord) -> Result<(), StorageError> {
        let errors = serde_json::to_value(&job.errors)
            .map_err(|e| StorageError::Corrupt(format!("insert_job errors: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO jobs (job_id, state, fingerprint, total, completed, succeeded,
                              errors, created_at, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(Uuid::from(job.job_id))
        .bind(job.state.as_str())
        .bind(job.fingerprint.as_str())
        .bind(job.total as i32)
        .bind(job.completed as i32)
        .bind(job.succeeded as i32)
        .bind(errors)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn fetch_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StorageError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
            .bind(Uuid::from(job_id))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_job", e))?;
        match row {
            None => Ok(None),
            Some(row) => {
                let job_row = JobRow::from_row(&row)
                    .map_err(|e| StorageError::Corrupt(format!("fetch_job: {e}")))?;
                Ok(Some(job_row.try_into()?))
            }
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn mark_processing(
        &self,
        job_id: JobId,
        started_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let id = Uuid::from(job_id);
        let updated = sqlx::query(
            "UPDATE jobs SET state = 'processing', started_at = $2 \
             WHERE job_id = $1 AND state = 'queued'",
        )
        .bind(id)
        .bind(started_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_processing", e))?
        .rows_affected();

        if updated == 1 {
            return Ok(());
        }
        match self.current_state("mark_processing", id).await? {
            None => Err(StorageError::NotFound(format!("job {job_id}"))),
            Some(JobState::Processing) => Ok(()),
            Some(state) => Err(StorageError::Conflict(format!(
                "cannot start processing a {state} job"
            ))),
        }
    }

    #[instrument(skip(self, delta), fields(job_id = %job_id), err)]
    async fn record_progress(
        &self,
        job_id: JobId,
        delta: ProgressDelta,
    ) -> Result<(), StorageError> {
        let id = Uuid::from(job_id);
        let appended: Vec<_> = delta.error.iter().cloned().collect();
        let appended = serde_json::to_value(appended)
            .map_err(|e| StorageError::Corrupt(format!("record_progress errors: {e}")))?;

        // One guarded statement: counters, error append, and — when the
        // earlier status flip was lost — the queued → processing promotion.
        let updated = sqlx::query(
            r#"
            UPDATE jobs SET
                completed  = completed + $2,
                succeeded  = succeeded + $3,
                errors     = errors || $4,
                state      = CASE WHEN state = 'queued' THEN 'processing' ELSE state END,
                started_at = COALESCE(started_at, $5)
            WHERE job_id = $1
              AND state IN ('queued', 'processing')
              AND completed + $2 <= total
              AND succeeded + $3 <= completed + $2
            "#,
        )
        .bind(id)
        .bind(delta.completed as i32)
        .bind(delta.succeeded as i32)
        .bind(appended)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_progress", e))?
        .rows_affected();

        if updated == 1 {
            return Ok(());
        }
        match self.current_state("record_progress", id).await? {
            None => Err(StorageError::NotFound(format!("job {job_id}"))),
            Some(state) if state.is_terminal() => Err(StorageError::Conflict(format!(
                "cannot record progress on a {state} job"
            ))),
            Some(_) => Err(StorageError::Conflict(
                "progress delta would exceed job totals".to_string(),
            )),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id, state = %state), err)]
    async fn mark_terminal(
        &self,
        job_id: JobId,
        state: JobState,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let id = Uuid::from(job_id);
        let updated = sqlx::query(
            "UPDATE jobs SET state = $2, completed_at = $3 \
             WHERE job_id = $1 AND state IN ('queued', 'processing')",
        )
        .bind(id)
        .bind(state.as_str())
        .bind(completed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_terminal", e))?
        .rows_affected();

        if updated == 1 {
            return Ok(());
        }
        match self.current_state("mark_terminal", id).await? {
            None => Err(StorageError::NotFound(format!("job {job_id}"))),
            // A retried write whose first attempt committed: idempotent.
            Some(current) if current == state => Ok(()),
            Some(current) => Err(StorageError::Conflict(format!(
                "job already terminal ({current}), cannot move to {state}"
            ))),
        }
    }

    #[instrument(skip(self), fields(fingerprint = %fingerprint), err)]
    async fn find_active_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        created_after: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE fingerprint = $1 AND state IN ('queued', 'processing') \
               AND created_at >= $2 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(fingerprint.as_str())
        .bind(created_after)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_active_by_fingerprint", e))?;
        match row {
            None => Ok(None),
            Some(row) => {
                let job_row = JobRow::from_row(&row).map_err(|e| {
                    StorageError::Corrupt(format!("find_active_by_fingerprint: {e}"))
                })?;
                Ok(Some(job_row.try_into()?))
            }
        }
    }

    #[instrument(skip(self), err)]
    async fn active_jobs(&self) -> Result<Vec<JobRecord>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE state IN ('queued', 'processing') \
             ORDER BY created_at DESC"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_jobs", e))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let job_row = JobRow::from_row(&row)
                .map_err(|e| StorageError::Corrupt(format!("active_jobs: {e}")))?;
            jobs.push(job_row.try_into()?);
        }
        Ok(jobs)
    }
}

#[derive(Debug, FromRow)]
struct ResultRow {
    job_id: Uuid,
    symbol: String,
    as_of: NaiveDate,
    outcome: String,
    score: f64,
    label: String,
    payload_ref: Uuid,
    created_at: DateTime<Utc>,
}

impl TryFrom<ResultRow> for TargetResult {
    type Error = StorageError;

    fn try_from(row: ResultRow) -> Result<Self, Self::Error> {
        let symbol = Symbol::parse(&row.symbol)
            .map_err(|e| StorageError::Corrupt(format!("result symbol: {e}")))?;
        let outcome = OutcomeClass::from_str(&row.outcome)
            .map_err(|e| StorageError::Corrupt(format!("result outcome: {e}")))?;
        Ok(TargetResult {
            job_id: JobId::from_uuid(row.job_id),
            symbol,
            as_of: row.as_of,
            outcome,
            score: row.score,
            label: row.label,
            payload_ref: PayloadId::from_uuid(row.payload_ref),
            created_at: row.created_at,
        })
    }
}

const RESULT_COLUMNS: &str =
    "job_id, symbol, as_of, outcome, score, label, payload_ref, created_at";

/// Postgres-backed result store.
#[derive(Debug, Clone)]
pub struct PostgresResultStore {
    pool: Arc<PgPool>,
}

impl PostgresResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ResultStore for PostgresResultStore {
    #[instrument(skip(self, result, payload), fields(symbol = %result.symbol), err)]
    async fn put(&self, result: &TargetResult, payload: &JsonValue) -> Result<(), StorageError> {
        // Payload and summary row commit together; a half-written result is
        // worse than a retried one.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("put", e))?;

        sqlx::query(
            "INSERT INTO result_payloads (payload_ref, payload, created_at) VALUES ($1, $2, $3)",
        )
        .bind(Uuid::from(result.payload_ref))
        .bind(payload)
        .bind(result.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("put", e))?;

        sqlx::query(
            r#"
            INSERT INTO target_results (job_id, symbol, as_of, outcome, score, label,
                                        payload_ref, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::from(result.job_id))
        .bind(result.symbol.as_str())
        .bind(result.as_of)
        .bind(result.outcome.as_str())
        .bind(result.score)
        .bind(result.label.as_str())
        .bind(Uuid::from(result.payload_ref))
        .bind(result.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("put", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("put", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(symbol = %symbol), err)]
    async fn latest_for(
        &self,
        symbol: &Symbol,
        as_of: NaiveDate,
    ) -> Result<Option<TargetResult>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {RESULT_COLUMNS} FROM target_results \
             WHERE symbol = $1 AND as_of = $2 \
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(symbol.as_str())
        .bind(as_of)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_for", e))?;
        match row {
            None => Ok(None),
            Some(row) => {
                let result_row = ResultRow::from_row(&row)
                    .map_err(|e| StorageError::Corrupt(format!("latest_for: {e}")))?;
                Ok(Some(result_row.try_into()?))
            }
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn for_job(&self, job_id: JobId) -> Result<Vec<TargetResult>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {RESULT_COLUMNS} FROM target_results WHERE job_id = $1 ORDER BY id"
        ))
        .bind(Uuid::from(job_id))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("for_job", e))?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let result_row = ResultRow::from_row(&row)
                .map_err(|e| StorageError::Corrupt(format!("for_job: {e}")))?;
            results.push(result_row.try_into()?);
        }
        Ok(results)
    }

    #[instrument(skip(self), fields(payload_ref = %payload_ref), err)]
    async fn payload(&self, payload_ref: PayloadId) -> Result<Option<JsonValue>, StorageError> {
        let row = sqlx::query("SELECT payload FROM result_payloads WHERE payload_ref = $1")
            .bind(Uuid::from(payload_ref))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("payload", e))?;
        match row {
            None => Ok(None),
            Some(row) => {
                let payload: JsonValue = row
                    .try_get("payload")
                    .map_err(|e| map_sqlx_error("payload", e))?;
                Ok(Some(payload))
            }
        }
    }
}
