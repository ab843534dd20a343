//! Job admission: validate, coalesce duplicates, insert, hand off.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use marketsieve_core::{normalize_targets, Fingerprint, JobId};

use crate::dedupe::DuplicateGuard;
use crate::error::JobError;
use crate::executor::JobExecutor;
use crate::job::{JobRecord, JobState};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::JobStore;

/// What the caller gets back from admission.
///
/// A duplicate hit is a success: the ticket describes the existing job and
/// `is_duplicate` is set. `execution_started` reports only the hand-off to
/// the executor — the job row may well exist even when it is `false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTicket {
    pub job_id: JobId,
    pub state: JobState,
    pub is_duplicate: bool,
    pub execution_started: bool,
}

/// Admits new jobs, or returns the equivalent in-flight one.
pub struct JobCreator {
    jobs: Arc<dyn JobStore>,
    guard: DuplicateGuard,
    retry: RetryPolicy,
    executor: JobExecutor,
}

impl JobCreator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        guard: DuplicateGuard,
        retry: RetryPolicy,
        executor: JobExecutor,
    ) -> Self {
        Self {
            jobs,
            guard,
            retry,
            executor,
        }
    }

    /// Admit a submission.
    ///
    /// - Empty (post-normalization) target lists fail validation before
    ///   storage is touched.
    /// - Without `force`, a fingerprint match against a recent active job
    ///   returns that job's ticket instead of creating work.
    /// - The insert runs under the retry policy; exhaustion surfaces as
    ///   [`JobError::CreationFailed`] and is never reported as a duplicate.
    pub async fn create<S: AsRef<str>>(
        &self,
        targets: &[S],
        force: bool,
    ) -> Result<JobTicket, JobError> {
        let symbols =
            normalize_targets(targets).map_err(|e| JobError::Validation(e.to_string()))?;
        if symbols.is_empty() {
            return Err(JobError::validation("target list is empty"));
        }
        let fingerprint = Fingerprint::of(&symbols);

        if !force {
            if let Some(existing) = self.guard.find_active(&fingerprint, Utc::now()).await {
                info!(
                    job_id = %existing.job_id,
                    fingerprint = %fingerprint,
                    "coalescing duplicate submission onto in-flight job"
                );
                return Ok(JobTicket {
                    job_id: existing.job_id,
                    state: existing.state,
                    is_duplicate: true,
                    execution_started: false,
                });
            }
        }

        let job = JobRecord::queued(
            JobId::new(),
            fingerprint,
            symbols.len() as u32,
            Utc::now(),
        );
        with_retry("insert_job", &self.retry, || self.jobs.insert_job(&job))
            .await
            .map_err(JobError::CreationFailed)?;

        let execution_started = self.executor.submit(job.clone(), symbols);
        info!(
            job_id = %job.job_id,
            total = job.total,
            execution_started,
            "job admitted"
        );

        Ok(JobTicket {
            job_id: job.job_id,
            state: job.state,
            is_duplicate: false,
            execution_started,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobsConfig;
    use crate::evaluator::{Evaluation, Evaluator, EvaluatorError};
    use crate::memory::{InMemoryJobStore, InMemoryResultStore};
    use crate::store::OutcomeClass;
    use async_trait::async_trait;
    use marketsieve_core::Symbol;
    use serde_json::json;
    use std::time::Duration;

    /// Never completes: keeps admitted jobs in-flight so duplicate
    /// detection in these tests is not racing job completion.
    struct PendingEvaluator;

    #[async_trait]
    impl Evaluator for PendingEvaluator {
        async fn evaluate(&self, symbol: &Symbol) -> Result<Evaluation, EvaluatorError> {
            std::future::pending::<()>().await;
            Ok(Evaluation {
                outcome: OutcomeClass::Neutral,
                score: 0.0,
                label: "pending".to_string(),
                payload: json!({ "symbol": symbol.as_str() }),
            })
        }
    }

    fn setup() -> (Arc<InMemoryJobStore>, JobCreator) {
        let jobs: Arc<InMemoryJobStore> = Arc::new(InMemoryJobStore::new());
        let store: Arc<dyn JobStore> = jobs.clone();
        let retry = RetryPolicy::new(3, Duration::from_millis(1));
        let config = JobsConfig {
            retry: retry.clone(),
            ..JobsConfig::default()
        };
        let executor = JobExecutor::new(
            store.clone(),
            Arc::new(InMemoryResultStore::new()),
            Arc::new(PendingEvaluator),
            &config,
        );
        let guard = DuplicateGuard::new(
            store.clone(),
            config.duplicate_window,
            retry.clone(),
        );
        (jobs, JobCreator::new(store, guard, retry, executor))
    }

    #[tokio::test]
    async fn empty_target_list_fails_validation() {
        let (jobs, creator) = setup();
        let err = creator.create::<&str>(&[], false).await.unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        // Storage untouched.
        assert!(jobs.active_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn all_blank_target_list_fails_validation() {
        let (_, creator) = setup();
        let err = creator.create(&["", "   "], false).await.unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[tokio::test]
    async fn admission_inserts_queued_row_and_hands_off() {
        let (jobs, creator) = setup();
        let ticket = creator.create(&["msft", " AAPL", "aapl"], false).await.unwrap();
        assert!(!ticket.is_duplicate);
        assert!(ticket.execution_started);
        assert_eq!(ticket.state, JobState::Queued);

        let row = jobs.fetch_job(ticket.job_id).await.unwrap().unwrap();
        // De-duplicated count: msft + aapl.
        assert_eq!(row.total, 2);
    }

    #[tokio::test]
    async fn permuted_resubmission_coalesces() {
        let (_, creator) = setup();
        let first = creator.create(&["AAA", "BBB"], false).await.unwrap();
        let second = creator.create(&["bbb", " aaa "], false).await.unwrap();
        assert!(second.is_duplicate);
        assert!(!second.execution_started);
        assert_eq!(second.job_id, first.job_id);
    }

    #[tokio::test]
    async fn force_skips_duplicate_detection() {
        let (_, creator) = setup();
        let first = creator.create(&["AAA"], true).await.unwrap();
        let second = creator.create(&["AAA"], true).await.unwrap();
        assert!(!second.is_duplicate);
        assert_ne!(second.job_id, first.job_id);
    }
}
