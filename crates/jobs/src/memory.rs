//! In-memory store implementations.
//!
//! Intended for tests/dev. Lock-based like the production engine, and
//! enforces the same monotonicity and counter invariants, so orchestration
//! code exercises identical semantics against either backend.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;

use marketsieve_core::{DomainError, Fingerprint, JobId, PayloadId, Symbol};

use crate::job::{JobRecord, JobState};
use crate::store::{JobStore, ProgressDelta, ResultStore, StorageError, TargetResult};

fn map_domain(e: DomainError) -> StorageError {
    StorageError::Conflict(e.to_string())
}

fn poisoned() -> StorageError {
    StorageError::Backend("lock poisoned".to_string())
}

/// In-memory job registry.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: &JobRecord) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.contains_key(&job.job_id) {
            return Err(StorageError::Conflict(format!(
                "job {} already exists",
                job.job_id
            )));
        }
        jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn fetch_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(&job_id).cloned())
    }

    async fn mark_processing(
        &self,
        job_id: JobId,
        started_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| StorageError::NotFound(format!("job {job_id}")))?;
        job.begin_processing(started_at).map_err(map_domain)
    }

    async fn record_progress(
        &self,
        job_id: JobId,
        delta: ProgressDelta,
    ) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| StorageError::NotFound(format!("job {job_id}")))?;
        job.apply_progress(&delta, Utc::now()).map_err(map_domain)
    }

    async fn mark_terminal(
        &self,
        job_id: JobId,
        state: JobState,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| StorageError::NotFound(format!("job {job_id}")))?;
        job.finish(state, completed_at).map_err(map_domain)
    }

    async fn find_active_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        created_after: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let hit = jobs
            .values()
            .filter(|j| {
                j.state.is_active()
                    && j.fingerprint == *fingerprint
                    && j.created_at >= created_after
            })
            .max_by_key(|j| j.created_at)
            .cloned();
        Ok(hit)
    }

    async fn active_jobs(&self) -> Result<Vec<JobRecord>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut active: Vec<JobRecord> = jobs
            .values()
            .filter(|j| j.state.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(active)
    }
}

/// In-memory result store: append-only rows plus detached payloads.
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    rows: RwLock<Vec<TargetResult>>,
    payloads: RwLock<HashMap<PayloadId, JsonValue>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(&self, result: &TargetResult, payload: &JsonValue) -> Result<(), StorageError> {
        {
            let mut payloads = self.payloads.write().map_err(|_| poisoned())?;
            payloads.insert(result.payload_ref, payload.clone());
        }
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        rows.push(result.clone());
        Ok(())
    }

    async fn latest_for(
        &self,
        symbol: &Symbol,
        as_of: NaiveDate,
    ) -> Result<Option<TargetResult>, StorageError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        // Append order doubles as recency order.
        Ok(rows
            .iter()
            .rev()
            .find(|r| r.symbol == *symbol && r.as_of == as_of)
            .cloned())
    }

    async fn for_job(&self, job_id: JobId) -> Result<Vec<TargetResult>, StorageError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.iter().filter(|r| r.job_id == job_id).cloned().collect())
    }

    async fn payload(&self, payload_ref: PayloadId) -> Result<Option<JsonValue>, StorageError> {
        let payloads = self.payloads.read().map_err(|_| poisoned())?;
        Ok(payloads.get(&payload_ref).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OutcomeClass;
    use serde_json::json;

    fn queued_job(fingerprint: &str, total: u32) -> JobRecord {
        let symbols = marketsieve_core::normalize_targets(fingerprint.split(',')).unwrap();
        JobRecord::queued(JobId::new(), Fingerprint::of(&symbols), total, Utc::now())
    }

    fn result_row(job_id: JobId, symbol: &str, as_of: NaiveDate, score: f64) -> TargetResult {
        TargetResult {
            job_id,
            symbol: Symbol::parse(symbol).unwrap(),
            as_of,
            outcome: OutcomeClass::Neutral,
            score,
            label: "baseline".to_string(),
            payload_ref: PayloadId::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_then_fetch_round_trips() {
        let store = InMemoryJobStore::new();
        let job = queued_job("AAA,BBB", 2);
        store.insert_job(&job).await.unwrap();
        let fetched = store.fetch_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(fetched, job);
    }

    #[tokio::test]
    async fn duplicate_job_id_is_a_conflict() {
        let store = InMemoryJobStore::new();
        let job = queued_job("AAA", 1);
        store.insert_job(&job).await.unwrap();
        let err = store.insert_job(&job).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn progress_on_missing_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let err = store
            .record_progress(JobId::new(), ProgressDelta::succeeded())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn fingerprint_lookup_ignores_terminal_and_stale_jobs() {
        let store = InMemoryJobStore::new();
        let window_start = Utc::now() - chrono::Duration::seconds(300);

        let mut done = queued_job("AAA,BBB", 2);
        done.finish(JobState::Completed, Utc::now()).unwrap();
        store.insert_job(&done).await.unwrap();

        let mut stale = queued_job("AAA,BBB", 2);
        stale.created_at = Utc::now() - chrono::Duration::seconds(600);
        store.insert_job(&stale).await.unwrap();

        let fingerprint = done.fingerprint.clone();
        assert!(store
            .find_active_by_fingerprint(&fingerprint, window_start)
            .await
            .unwrap()
            .is_none());

        let live = queued_job("AAA,BBB", 2);
        store.insert_job(&live).await.unwrap();
        let hit = store
            .find_active_by_fingerprint(&fingerprint, window_start)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.job_id, live.job_id);
    }

    #[tokio::test]
    async fn active_jobs_most_recent_first() {
        let store = InMemoryJobStore::new();
        let mut older = queued_job("AAA", 1);
        older.created_at = Utc::now() - chrono::Duration::seconds(60);
        let newer = queued_job("BBB", 1);
        store.insert_job(&older).await.unwrap();
        store.insert_job(&newer).await.unwrap();

        let active = store.active_jobs().await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].job_id, newer.job_id);
    }

    #[tokio::test]
    async fn second_write_for_same_day_becomes_current() {
        let store = InMemoryResultStore::new();
        let as_of = Utc::now().date_naive();
        let first = result_row(JobId::new(), "AAPL", as_of, 1.0);
        let second = result_row(JobId::new(), "AAPL", as_of, 2.0);

        store.put(&first, &json!({"v": 1})).await.unwrap();
        store.put(&second, &json!({"v": 2})).await.unwrap();

        let symbol = Symbol::parse("AAPL").unwrap();
        let current = store.latest_for(&symbol, as_of).await.unwrap().unwrap();
        assert_eq!(current.score, 2.0);
        let payload = store.payload(current.payload_ref).await.unwrap().unwrap();
        assert_eq!(payload, json!({"v": 2}));
    }

    #[tokio::test]
    async fn for_job_returns_summaries_in_write_order() {
        let store = InMemoryResultStore::new();
        let job_id = JobId::new();
        let as_of = Utc::now().date_naive();
        store
            .put(&result_row(job_id, "AAA", as_of, 1.0), &json!({}))
            .await
            .unwrap();
        store
            .put(&result_row(job_id, "BBB", as_of, 2.0), &json!({}))
            .await
            .unwrap();
        store
            .put(&result_row(JobId::new(), "CCC", as_of, 3.0), &json!({}))
            .await
            .unwrap();

        let rows = store.for_job(job_id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].symbol.as_str(), "AAA");
        assert_eq!(rows[1].symbol.as_str(), "BBB");
    }
}
