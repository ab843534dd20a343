//! Integration tests for the full job pipeline.
//!
//! Tests: admission → duplicate guard → executor → result store → progress
//!
//! Verifies:
//! - permuted/case-changed resubmissions coalesce onto the in-flight job
//! - forced submissions run independently
//! - partial failure completes the batch with recorded errors
//! - cancellation preserves work done before the check fired
//! - transient storage failures are absorbed without changing outcomes

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use tokio::sync::Semaphore;

    use marketsieve_core::{Fingerprint, JobId, Symbol};
    use marketsieve_jobs::{
        Evaluation, Evaluator, EvaluatorError, InMemoryJobStore, InMemoryResultStore, JobError,
        JobRecord, JobService, JobState, JobStore, JobsConfig, OutcomeClass, ProgressDelta,
        ResultStore, RetryPolicy, StorageError,
    };

    /// Evaluator that scores every symbol, optionally failing a fixed set.
    struct ScriptedEvaluator {
        fail: HashSet<String>,
    }

    impl ScriptedEvaluator {
        fn ok() -> Self {
            Self {
                fail: HashSet::new(),
            }
        }

        fn failing(symbols: &[&str]) -> Self {
            Self {
                fail: symbols.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl Evaluator for ScriptedEvaluator {
        async fn evaluate(&self, symbol: &Symbol) -> Result<Evaluation, EvaluatorError> {
            if self.fail.contains(symbol.as_str()) {
                return Err(EvaluatorError::NoData(symbol.to_string()));
            }
            Ok(Evaluation {
                outcome: OutcomeClass::Bullish,
                score: 0.7,
                label: "scripted".to_string(),
                payload: json!({ "symbol": symbol.as_str(), "score": 0.7 }),
            })
        }
    }

    /// Evaluator gated on a semaphore: each call consumes one permit.
    struct GatedEvaluator {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl Evaluator for GatedEvaluator {
        async fn evaluate(&self, symbol: &Symbol) -> Result<Evaluation, EvaluatorError> {
            let permit = Arc::clone(&self.gate)
                .acquire_owned()
                .await
                .map_err(|_| EvaluatorError::Unavailable("gate closed".to_string()))?;
            permit.forget();
            Ok(Evaluation {
                outcome: OutcomeClass::Neutral,
                score: 0.0,
                label: "gated".to_string(),
                payload: json!({ "symbol": symbol.as_str() }),
            })
        }
    }

    /// Job store wrapper that injects transient failures into chosen
    /// operations: the first `failures` calls of the named op return Busy.
    struct FlakyJobStore {
        inner: Arc<InMemoryJobStore>,
        flaky_op: &'static str,
        remaining: AtomicU32,
    }

    impl FlakyJobStore {
        fn new(inner: Arc<InMemoryJobStore>, flaky_op: &'static str, failures: u32) -> Self {
            Self {
                inner,
                flaky_op,
                remaining: AtomicU32::new(failures),
            }
        }

        fn trip(&self, op: &'static str) -> Result<(), StorageError> {
            if op == self.flaky_op {
                let left = self
                    .remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if left {
                    return Err(StorageError::Busy(format!("{op}: injected lock timeout")));
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl JobStore for FlakyJobStore {
        async fn insert_job(&self, job: &JobRecord) -> Result<(), StorageError> {
            self.trip("insert_job")?;
            self.inner.insert_job(job).await
        }

        async fn fetch_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StorageError> {
            self.trip("fetch_job")?;
            self.inner.fetch_job(job_id).await
        }

        async fn mark_processing(
            &self,
            job_id: JobId,
            started_at: DateTime<Utc>,
        ) -> Result<(), StorageError> {
            self.trip("mark_processing")?;
            self.inner.mark_processing(job_id, started_at).await
        }

        async fn record_progress(
            &self,
            job_id: JobId,
            delta: ProgressDelta,
        ) -> Result<(), StorageError> {
            self.trip("record_progress")?;
            self.inner.record_progress(job_id, delta).await
        }

        async fn mark_terminal(
            &self,
            job_id: JobId,
            state: JobState,
            completed_at: DateTime<Utc>,
        ) -> Result<(), StorageError> {
            self.trip("mark_terminal")?;
            self.inner.mark_terminal(job_id, state, completed_at).await
        }

        async fn find_active_by_fingerprint(
            &self,
            fingerprint: &Fingerprint,
            created_after: DateTime<Utc>,
        ) -> Result<Option<JobRecord>, StorageError> {
            self.trip("find_active_by_fingerprint")?;
            self.inner
                .find_active_by_fingerprint(fingerprint, created_after)
                .await
        }

        async fn active_jobs(&self) -> Result<Vec<JobRecord>, StorageError> {
            self.trip("active_jobs")?;
            self.inner.active_jobs().await
        }
    }

    fn test_config() -> JobsConfig {
        JobsConfig {
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
            ..JobsConfig::default()
        }
    }

    fn service_with(evaluator: Arc<dyn Evaluator>) -> (JobService, Arc<InMemoryResultStore>) {
        let results = Arc::new(InMemoryResultStore::new());
        let service = JobService::new(
            Arc::new(InMemoryJobStore::new()),
            results.clone(),
            evaluator,
            test_config(),
        );
        (service, results)
    }

    async fn wait_state(service: &JobService, job_id: JobId, state: JobState) {
        for _ in 0..500 {
            let progress = service.get_progress(job_id).await.unwrap();
            if progress.state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached {state}");
    }

    async fn wait_completed(service: &JobService, job_id: JobId, count: u32) {
        for _ in 0..500 {
            let progress = service.get_progress(job_id).await.unwrap();
            if progress.completed >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached completed={count}");
    }

    #[tokio::test]
    async fn permuted_resubmission_returns_same_job() {
        let gate = Arc::new(Semaphore::new(0)); // keep the first job in flight
        let (service, _) = service_with(Arc::new(GatedEvaluator {
            gate: Arc::clone(&gate),
        }));

        let first = service.create_job(&["AAA", "BBB"], false).await.unwrap();
        assert!(!first.is_duplicate);
        assert!(first.execution_started);

        let progress = service.get_progress(first.job_id).await.unwrap();
        assert_eq!(progress.total, 2);
        assert_eq!(progress.completed, 0);
        assert_eq!(progress.percent, 0.0);

        let second = service.create_job(&["bbb", " aaa "], false).await.unwrap();
        assert!(second.is_duplicate);
        assert!(!second.execution_started);
        assert_eq!(second.job_id, first.job_id);

        // Let the job drain and verify the terminal snapshot.
        gate.add_permits(8);
        wait_state(&service, first.job_id, JobState::Completed).await;
        let done = service.get_progress(first.job_id).await.unwrap();
        assert_eq!(done.completed, 2);
        assert_eq!(done.percent, 100.0);
    }

    #[tokio::test]
    async fn forced_submissions_run_independently() {
        let (service, results) = service_with(Arc::new(ScriptedEvaluator::ok()));

        let first = service.create_job(&["AAA"], true).await.unwrap();
        let second = service.create_job(&["AAA"], true).await.unwrap();
        assert_ne!(first.job_id, second.job_id);
        assert!(!first.is_duplicate);
        assert!(!second.is_duplicate);

        wait_state(&service, first.job_id, JobState::Completed).await;
        wait_state(&service, second.job_id, JobState::Completed).await;

        // Both jobs produced their own attributed result rows.
        assert_eq!(results.for_job(first.job_id).await.unwrap().len(), 1);
        assert_eq!(results.for_job(second.job_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn one_failing_target_completes_with_recorded_error() {
        let (service, results) =
            service_with(Arc::new(ScriptedEvaluator::failing(&["CCC"])));

        let ticket = service
            .create_job(&["AAA", "BBB", "CCC", "DDD"], false)
            .await
            .unwrap();
        wait_state(&service, ticket.job_id, JobState::Completed).await;

        let status = service.get_job_status(ticket.job_id).await.unwrap();
        assert_eq!(status.progress.completed, 4);
        assert_eq!(status.progress.succeeded, 3);
        assert_eq!(status.progress.failed_count, 1);
        assert_eq!(status.errors.len(), 1);
        assert_eq!(status.errors[0].symbol.as_str(), "CCC");

        assert_eq!(results.for_job(ticket.job_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn cancellation_preserves_completed_work() {
        let gate = Arc::new(Semaphore::new(1));
        let (service, results) = service_with(Arc::new(GatedEvaluator {
            gate: Arc::clone(&gate),
        }));

        let ticket = service
            .create_job(&["AAA", "BBB", "CCC", "DDD", "EEE"], false)
            .await
            .unwrap();
        wait_completed(&service, ticket.job_id, 1).await;

        service.cancel_job(ticket.job_id).await.unwrap();
        // The in-flight second evaluation may finish; nothing beyond it runs.
        gate.add_permits(16);

        wait_state(&service, ticket.job_id, JobState::Cancelled).await;
        let progress = service.get_progress(ticket.job_id).await.unwrap();
        assert!(progress.completed >= 1 && progress.completed <= 2);
        assert_eq!(
            results.for_job(ticket.job_id).await.unwrap().len(),
            progress.completed as usize
        );
    }

    #[tokio::test]
    async fn same_day_rewrite_supersedes_prior_result() {
        let (service, results) = service_with(Arc::new(ScriptedEvaluator::ok()));

        let first = service.create_job(&["AAPL"], false).await.unwrap();
        wait_state(&service, first.job_id, JobState::Completed).await;
        let second = service.create_job(&["AAPL"], true).await.unwrap();
        wait_state(&service, second.job_id, JobState::Completed).await;

        let symbol = Symbol::parse("AAPL").unwrap();
        let as_of = Utc::now().date_naive();
        let current = results.latest_for(&symbol, as_of).await.unwrap().unwrap();
        // The later write is the current one; the stale row still exists
        // but is never selected.
        assert_eq!(current.job_id, second.job_id);
        let payload = results.payload(current.payload_ref).await.unwrap().unwrap();
        assert_eq!(payload, json!({ "symbol": "AAPL", "score": 0.7 }));
    }

    #[tokio::test]
    async fn transient_insert_failures_do_not_change_the_outcome() {
        let inner = Arc::new(InMemoryJobStore::new());
        let flaky = Arc::new(FlakyJobStore::new(inner.clone(), "insert_job", 2));
        let service = JobService::new(
            flaky,
            Arc::new(InMemoryResultStore::new()),
            Arc::new(ScriptedEvaluator::ok()),
            test_config(),
        );

        // Fails twice, succeeds on the third attempt — indistinguishable
        // from a first-try success, modulo timestamps.
        let ticket = service.create_job(&["AAA", "BBB"], false).await.unwrap();
        assert!(!ticket.is_duplicate);
        wait_state(&service, ticket.job_id, JobState::Completed).await;

        let row = inner.fetch_job(ticket.job_id).await.unwrap().unwrap();
        assert_eq!(row.total, 2);
        assert_eq!(row.completed, 2);
        assert_eq!(row.succeeded, 2);
        assert!(row.errors.is_empty());
    }

    #[tokio::test]
    async fn exhausted_insert_retries_fail_creation_not_duplicate() {
        let inner = Arc::new(InMemoryJobStore::new());
        let flaky = Arc::new(FlakyJobStore::new(inner.clone(), "insert_job", 10));
        let service = JobService::new(
            flaky,
            Arc::new(InMemoryResultStore::new()),
            Arc::new(ScriptedEvaluator::ok()),
            test_config(),
        );

        let err = service.create_job(&["AAA"], false).await.unwrap_err();
        // Creation failure is never reported as a duplicate.
        assert!(matches!(err, JobError::CreationFailed(_)));
        assert!(inner.active_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lost_status_flip_is_repaired_by_progress_writes() {
        let inner = Arc::new(InMemoryJobStore::new());
        // All three mark_processing attempts fail; the job must still run.
        let flaky = Arc::new(FlakyJobStore::new(inner.clone(), "mark_processing", 3));
        let service = JobService::new(
            flaky,
            Arc::new(InMemoryResultStore::new()),
            Arc::new(ScriptedEvaluator::ok()),
            test_config(),
        );

        let ticket = service.create_job(&["AAA", "BBB"], false).await.unwrap();
        wait_state(&service, ticket.job_id, JobState::Completed).await;

        let row = inner.fetch_job(ticket.job_id).await.unwrap().unwrap();
        // The first progress write promoted the row and stamped started_at.
        assert_eq!(row.completed, 2);
        assert!(row.started_at.is_some());
    }

    #[tokio::test]
    async fn contended_progress_writes_are_absorbed() {
        let inner = Arc::new(InMemoryJobStore::new());
        let flaky = Arc::new(FlakyJobStore::new(inner.clone(), "record_progress", 2));
        let service = JobService::new(
            flaky,
            Arc::new(InMemoryResultStore::new()),
            Arc::new(ScriptedEvaluator::ok()),
            test_config(),
        );

        let ticket = service.create_job(&["AAA", "BBB", "CCC"], false).await.unwrap();
        wait_state(&service, ticket.job_id, JobState::Completed).await;

        let row = inner.fetch_job(ticket.job_id).await.unwrap().unwrap();
        assert_eq!(row.completed, 3);
        assert_eq!(row.succeeded, 3);
    }

    #[tokio::test]
    async fn active_jobs_lists_in_flight_most_recent_first() {
        let gate = Arc::new(Semaphore::new(0));
        let (service, _) = service_with(Arc::new(GatedEvaluator {
            gate: Arc::clone(&gate),
        }));

        let first = service.create_job(&["AAA"], false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = service.create_job(&["BBB"], false).await.unwrap();

        let active = service.get_active_jobs().await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].job_id, second.job_id);
        assert_eq!(active[1].job_id, first.job_id);

        gate.add_permits(8);
        wait_state(&service, first.job_id, JobState::Completed).await;
        wait_state(&service, second.job_id, JobState::Completed).await;
        assert!(service.get_active_jobs().await.unwrap().is_empty());
    }
}
