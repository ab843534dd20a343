//! Configuration for the job subsystem.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Tunables for admission, retries, and the executor pool.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Trailing window for duplicate detection: a submission whose
    /// fingerprint matches a queued/processing job created within this
    /// window coalesces onto that job.
    pub duplicate_window: Duration,

    /// Retry policy applied to every individual storage write/read.
    pub retry: RetryPolicy,

    /// Upper bound on concurrently executing jobs; admissions beyond it
    /// queue behind a semaphore rather than spawning unbounded work.
    pub max_concurrent_jobs: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            duplicate_window: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            max_concurrent_jobs: 8,
        }
    }
}
