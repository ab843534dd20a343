//! Duplicate suppression for semantically identical submissions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use marketsieve_core::Fingerprint;

use crate::job::JobRecord;
use crate::retry::{with_retry, RetryPolicy};
use crate::store::JobStore;

/// Looks up an equivalent in-flight job for a fingerprint.
///
/// The trailing window is configurable (`JobsConfig::duplicate_window`);
/// outside it, a matching fingerprint no longer counts as a duplicate and a
/// fresh job is admitted.
pub struct DuplicateGuard {
    jobs: Arc<dyn JobStore>,
    window: Duration,
    retry: RetryPolicy,
}

impl DuplicateGuard {
    pub fn new(jobs: Arc<dyn JobStore>, window: Duration, retry: RetryPolicy) -> Self {
        Self {
            jobs,
            window,
            retry,
        }
    }

    /// Most recent queued/processing job with this fingerprint created
    /// within the window, or `None`.
    ///
    /// An empty fingerprint never matches anything. A lookup that still
    /// fails after retries degrades to "no duplicate": duplicate work is
    /// recoverable, refusing admission over a read hiccup is not.
    pub async fn find_active(
        &self,
        fingerprint: &Fingerprint,
        now: DateTime<Utc>,
    ) -> Option<JobRecord> {
        if fingerprint.is_empty() {
            return None;
        }

        let window = chrono::Duration::from_std(self.window)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let created_after = now - window;

        match with_retry("find_active_by_fingerprint", &self.retry, || {
            self.jobs.find_active_by_fingerprint(fingerprint, created_after)
        })
        .await
        {
            Ok(hit) => hit,
            Err(e) => {
                warn!(
                    fingerprint = %fingerprint,
                    error = %e,
                    "duplicate lookup failed, admitting as new job"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use crate::memory::InMemoryJobStore;
    use marketsieve_core::{normalize_targets, JobId};

    fn guard(jobs: Arc<dyn JobStore>) -> DuplicateGuard {
        DuplicateGuard::new(
            jobs,
            Duration::from_secs(300),
            RetryPolicy::new(3, Duration::from_millis(1)),
        )
    }

    fn job_with(fingerprint: &Fingerprint, created_at: DateTime<Utc>) -> JobRecord {
        let mut job = JobRecord::queued(JobId::new(), fingerprint.clone(), 2, created_at);
        job.created_at = created_at;
        job
    }

    #[tokio::test]
    async fn finds_recent_active_job() {
        let store = Arc::new(InMemoryJobStore::new());
        let symbols = normalize_targets(["AAA", "BBB"]).unwrap();
        let fingerprint = Fingerprint::of(&symbols);
        let job = job_with(&fingerprint, Utc::now());
        store.insert_job(&job).await.unwrap();

        let guard = guard(store);
        let hit = guard.find_active(&fingerprint, Utc::now()).await.unwrap();
        assert_eq!(hit.job_id, job.job_id);
    }

    #[tokio::test]
    async fn ignores_jobs_outside_window() {
        let store = Arc::new(InMemoryJobStore::new());
        let symbols = normalize_targets(["AAA"]).unwrap();
        let fingerprint = Fingerprint::of(&symbols);
        let job = job_with(&fingerprint, Utc::now() - chrono::Duration::seconds(600));
        store.insert_job(&job).await.unwrap();

        let guard = guard(store);
        assert!(guard.find_active(&fingerprint, Utc::now()).await.is_none());
    }

    #[tokio::test]
    async fn ignores_terminal_jobs() {
        let store = Arc::new(InMemoryJobStore::new());
        let symbols = normalize_targets(["AAA"]).unwrap();
        let fingerprint = Fingerprint::of(&symbols);
        let mut job = job_with(&fingerprint, Utc::now());
        job.finish(JobState::Cancelled, Utc::now()).unwrap();
        store.insert_job(&job).await.unwrap();

        let guard = guard(store);
        assert!(guard.find_active(&fingerprint, Utc::now()).await.is_none());
    }

    #[tokio::test]
    async fn empty_fingerprint_never_matches() {
        let store = Arc::new(InMemoryJobStore::new());
        let guard = guard(store);
        let empty = Fingerprint::of(&[]);
        assert!(guard.find_active(&empty, Utc::now()).await.is_none());
    }

    #[tokio::test]
    async fn picks_most_recent_of_several_matches() {
        let store = Arc::new(InMemoryJobStore::new());
        let symbols = normalize_targets(["AAA"]).unwrap();
        let fingerprint = Fingerprint::of(&symbols);
        let older = job_with(&fingerprint, Utc::now() - chrono::Duration::seconds(60));
        let newer = job_with(&fingerprint, Utc::now());
        store.insert_job(&older).await.unwrap();
        store.insert_job(&newer).await.unwrap();

        let guard = guard(store);
        let hit = guard.find_active(&fingerprint, Utc::now()).await.unwrap();
        assert_eq!(hit.job_id, newer.job_id);
    }
}
