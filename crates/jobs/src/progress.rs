//! Read-side progress views for polling clients.
//!
//! Pure reads against the job registry; nothing here mutates state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use marketsieve_core::JobId;

use crate::error::JobError;
use crate::job::{JobRecord, JobState, TargetError};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::JobStore;

/// Poll-friendly progress snapshot of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: JobId,
    pub state: JobState,
    pub total: u32,
    pub completed: u32,
    pub succeeded: u32,
    pub failed_count: u32,
    /// 0.0 when `total` is 0 — never a division by zero.
    pub percent: f64,
    /// Extrapolated from elapsed time over completed targets; `None` until
    /// at least one target finished, and for jobs no longer processing.
    pub estimated_remaining_ms: Option<u64>,
}

/// Full status for one job: progress plus the per-target error list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    #[serde(flatten)]
    pub progress: JobProgress,
    pub errors: Vec<TargetError>,
}

fn percent(completed: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        f64::from(completed) / f64::from(total) * 100.0
    }
}

fn estimated_remaining_ms(job: &JobRecord, now: DateTime<Utc>) -> Option<u64> {
    if job.state != JobState::Processing || job.completed == 0 || job.completed >= job.total {
        return None;
    }
    let started_at = job.started_at?;
    let elapsed_ms = (now - started_at).num_milliseconds().max(0) as f64;
    let per_target_ms = elapsed_ms / f64::from(job.completed);
    let remaining = per_target_ms * f64::from(job.total - job.completed);
    Some(remaining as u64)
}

fn progress_view(job: &JobRecord, now: DateTime<Utc>) -> JobProgress {
    JobProgress {
        job_id: job.job_id,
        state: job.state,
        total: job.total,
        completed: job.completed,
        succeeded: job.succeeded,
        failed_count: job.failed_count(),
        percent: percent(job.completed, job.total),
        estimated_remaining_ms: estimated_remaining_ms(job, now),
    }
}

/// Read-side aggregation over the job registry.
pub struct ProgressAggregator {
    jobs: Arc<dyn JobStore>,
    retry: RetryPolicy,
}

impl ProgressAggregator {
    pub fn new(jobs: Arc<dyn JobStore>, retry: RetryPolicy) -> Self {
        Self { jobs, retry }
    }

    /// Progress snapshot for one job.
    pub async fn get_progress(&self, job_id: JobId) -> Result<JobProgress, JobError> {
        let job = self.fetch(job_id).await?;
        Ok(progress_view(&job, Utc::now()))
    }

    /// Full status (progress + error list) for one job.
    pub async fn get_status(&self, job_id: JobId) -> Result<JobStatus, JobError> {
        let job = self.fetch(job_id).await?;
        Ok(JobStatus {
            progress: progress_view(&job, Utc::now()),
            errors: job.errors,
        })
    }

    /// Every queued/processing job, most recent first — dashboard polling
    /// without a known job id.
    pub async fn active_jobs(&self) -> Result<Vec<JobProgress>, JobError> {
        let jobs = with_retry("active_jobs", &self.retry, || self.jobs.active_jobs()).await?;
        let now = Utc::now();
        Ok(jobs.iter().map(|j| progress_view(j, now)).collect())
    }

    async fn fetch(&self, job_id: JobId) -> Result<JobRecord, JobError> {
        with_retry("fetch_job", &self.retry, || self.jobs.fetch_job(job_id))
            .await?
            .ok_or(JobError::NotFound(job_id))
    }
}
