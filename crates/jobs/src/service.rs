//! `JobService` — the external surface of the job subsystem.
//!
//! Composes admission, execution, progress reads, and cancellation over a
//! pair of storage ports and an evaluator. Callers (HTTP handlers, CLI,
//! schedulers) talk only to this facade.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use marketsieve_core::JobId;

use crate::config::JobsConfig;
use crate::creator::{JobCreator, JobTicket};
use crate::dedupe::DuplicateGuard;
use crate::error::JobError;
use crate::evaluator::Evaluator;
use crate::executor::JobExecutor;
use crate::job::JobState;
use crate::progress::{JobProgress, JobStatus, ProgressAggregator};
use crate::retry::with_retry;
use crate::store::{JobStore, ResultStore};

pub struct JobService {
    jobs: Arc<dyn JobStore>,
    creator: JobCreator,
    executor: JobExecutor,
    progress: ProgressAggregator,
    config: JobsConfig,
}

impl JobService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        results: Arc<dyn ResultStore>,
        evaluator: Arc<dyn Evaluator>,
        config: JobsConfig,
    ) -> Self {
        let executor = JobExecutor::new(jobs.clone(), results, evaluator, &config);
        let guard = DuplicateGuard::new(
            jobs.clone(),
            config.duplicate_window,
            config.retry.clone(),
        );
        let creator = JobCreator::new(
            jobs.clone(),
            guard,
            config.retry.clone(),
            executor.clone(),
        );
        let progress = ProgressAggregator::new(jobs.clone(), config.retry.clone());
        Self {
            jobs,
            creator,
            executor,
            progress,
            config,
        }
    }

    /// Admit a batch for background evaluation.
    ///
    /// Fails with [`JobError::Validation`] on an empty target list and with
    /// [`JobError::CreationFailed`] when the creation insert exhausted its
    /// retries. A duplicate in-flight job is a success
    /// (`is_duplicate = true`).
    pub async fn create_job<S: AsRef<str>>(
        &self,
        targets: &[S],
        force: bool,
    ) -> Result<JobTicket, JobError> {
        self.creator.create(targets, force).await
    }

    /// Progress plus per-target errors for one job.
    pub async fn get_job_status(&self, job_id: JobId) -> Result<JobStatus, JobError> {
        self.progress.get_status(job_id).await
    }

    /// Progress snapshot for one job.
    pub async fn get_progress(&self, job_id: JobId) -> Result<JobProgress, JobError> {
        self.progress.get_progress(job_id).await
    }

    /// All queued/processing jobs, most recent first.
    pub async fn get_active_jobs(&self) -> Result<Vec<JobProgress>, JobError> {
        self.progress.active_jobs().await
    }

    /// Best-effort cooperative cancellation.
    ///
    /// Acknowledges receipt; the job stops at its next per-target boundary,
    /// and an in-flight evaluation is allowed to finish. Results already
    /// written are preserved. Unknown ids fail with [`JobError::NotFound`].
    pub async fn cancel_job(&self, job_id: JobId) -> Result<(), JobError> {
        let job = with_retry("fetch_job", &self.config.retry, || {
            self.jobs.fetch_job(job_id)
        })
        .await?
        .ok_or(JobError::NotFound(job_id))?;

        if job.state.is_terminal() {
            // Nothing left to stop; acknowledging is still correct.
            return Ok(());
        }

        if self.executor.cancel(job_id) {
            info!(job_id = %job_id, "cancellation requested");
            return Ok(());
        }

        // Active row but no live task (e.g. hand-off never happened).
        // Finalize the row directly so the job cannot sit queued forever.
        match with_retry("mark_terminal", &self.config.retry, || {
            self.jobs
                .mark_terminal(job_id, JobState::Cancelled, Utc::now())
        })
        .await
        {
            Ok(()) => info!(job_id = %job_id, "queued job cancelled directly"),
            Err(e) => warn!(job_id = %job_id, error = %e, "direct cancellation write failed"),
        }
        Ok(())
    }

    /// Stop accepting jobs and wait for in-flight executions.
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
    }
}
