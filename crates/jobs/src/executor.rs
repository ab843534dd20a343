//! Job execution: one background task per admitted job.
//!
//! Each job is driven by exactly one task for its whole lifetime; admission
//! is fire-and-forget. Concurrency is bounded by a semaphore rather than an
//! unbounded spawn per submission, and each job gets a cooperative
//! cancellation flag checked at per-target loop boundaries — an in-flight
//! evaluator call is allowed to finish, there is no preemption.
//!
//! Failure discipline inside the loop:
//! - an evaluator error is a per-target fact, recorded and skipped;
//! - every storage write (status flip, result row, progress) runs in its
//!   own bounded retry scope, so a contended write never forces re-running
//!   the expensive evaluation and never aborts the remaining targets;
//! - bookkeeping writes that still fail after retries are logged, not
//!   propagated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use marketsieve_core::{JobId, PayloadId, Symbol};

use crate::config::JobsConfig;
use crate::evaluator::Evaluator;
use crate::job::{JobRecord, JobState};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{JobStore, ProgressDelta, ResultStore, StorageError, TargetResult};

/// Per-job cancellation flags.
///
/// A flag is registered at hand-off and removed when the job's task exits;
/// cancelling an unknown job is a no-op reported to the caller.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    inner: Arc<Mutex<HashMap<JobId, watch::Sender<bool>>>>,
}

impl CancellationRegistry {
    fn register(&self, job_id: JobId) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        if let Ok(mut map) = self.inner.lock() {
            map.insert(job_id, tx);
        }
        rx
    }

    /// Request cancellation. Returns whether a live job was signalled.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.inner.lock() {
            Ok(map) => match map.get(&job_id) {
                Some(tx) => tx.send(true).is_ok(),
                None => false,
            },
            Err(_) => false,
        }
    }

    fn remove(&self, job_id: JobId) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(&job_id);
        }
    }
}

struct ExecutorInner {
    jobs: Arc<dyn JobStore>,
    results: Arc<dyn ResultStore>,
    evaluator: Arc<dyn Evaluator>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    cancellations: CancellationRegistry,
    accepting: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Bounded pool of per-job execution tasks.
#[derive(Clone)]
pub struct JobExecutor {
    inner: Arc<ExecutorInner>,
}

impl JobExecutor {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        results: Arc<dyn ResultStore>,
        evaluator: Arc<dyn Evaluator>,
        config: &JobsConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                jobs,
                results,
                evaluator,
                retry: config.retry.clone(),
                permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
                cancellations: CancellationRegistry::default(),
                accepting: AtomicBool::new(true),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Hand an admitted job off for background execution.
    ///
    /// Returns whether the hand-off was accepted — distinct from whether the
    /// job row was written (admission already persisted it) and from
    /// whether execution will succeed. `false` only after [`shutdown`].
    ///
    /// [`shutdown`]: JobExecutor::shutdown
    pub fn submit(&self, job: JobRecord, symbols: Vec<Symbol>) -> bool {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            warn!(job_id = %job.job_id, "executor is shut down, job left queued");
            return false;
        }

        let inner = Arc::clone(&self.inner);
        let cancel = inner.cancellations.register(job.job_id);
        let handle = tokio::spawn(async move {
            inner.run_job(job, symbols, cancel).await;
        });
        if let Ok(mut handles) = self.inner.handles.lock() {
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }
        true
    }

    /// Request cooperative cancellation. Returns whether a live job task was
    /// signalled; the job stops at its next per-target loop boundary.
    pub fn cancel(&self, job_id: JobId) -> bool {
        self.inner.cancellations.cancel(job_id)
    }

    /// Stop accepting hand-offs and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = match self.inner.handles.lock() {
            Ok(mut held) => held.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl ExecutorInner {
    async fn run_job(
        &self,
        job: JobRecord,
        symbols: Vec<Symbol>,
        cancel: watch::Receiver<bool>,
    ) {
        let job_id = job.job_id;
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.cancellations.remove(job_id);
                return;
            }
        };

        info!(job_id = %job_id, total = job.total, "job execution started");

        if !self.start_processing(job_id).await {
            self.cancellations.remove(job_id);
            return;
        }

        let mut processed = 0u32;
        for symbol in &symbols {
            // Cooperative cancellation, checked only at loop boundaries: an
            // in-flight evaluator call always finishes first.
            if *cancel.borrow() {
                info!(job_id = %job_id, processed, "cancellation observed, stopping");
                self.finish(job_id, JobState::Cancelled).await;
                self.cancellations.remove(job_id);
                return;
            }

            let delta = match self.evaluator.evaluate(symbol).await {
                Ok(evaluation) => {
                    let result = TargetResult {
                        job_id,
                        symbol: symbol.clone(),
                        as_of: Utc::now().date_naive(),
                        outcome: evaluation.outcome,
                        score: evaluation.score,
                        label: evaluation.label.clone(),
                        payload_ref: PayloadId::new(),
                        created_at: Utc::now(),
                    };
                    // Result persistence has its own retry scope: a storage
                    // hiccup here never re-runs the evaluation.
                    if let Err(e) = with_retry("put_result", &self.retry, || {
                        self.results.put(&result, &evaluation.payload)
                    })
                    .await
                    {
                        warn!(
                            job_id = %job_id,
                            symbol = %symbol,
                            error = %e,
                            "result write failed after retries, progress still recorded"
                        );
                    }
                    ProgressDelta::succeeded()
                }
                Err(e) => {
                    warn!(job_id = %job_id, symbol = %symbol, error = %e, "target evaluation failed");
                    ProgressDelta::failed(symbol.clone(), e.to_string())
                }
            };

            if let Err(e) = with_retry("record_progress", &self.retry, || {
                self.jobs.record_progress(job_id, delta.clone())
            })
            .await
            {
                warn!(
                    job_id = %job_id,
                    symbol = %symbol,
                    error = %e,
                    "progress write failed after retries, continuing with next target"
                );
            }
            processed += 1;
        }

        // Partial failure is not job failure: the batch completed.
        self.finish(job_id, JobState::Completed).await;
        self.cancellations.remove(job_id);
        info!(job_id = %job_id, processed, "job execution finished");
    }

    /// Flip the job to processing. Returns `false` only for a catastrophic
    /// pre-loop condition (row unusable before any target was attempted) —
    /// a merely stuck status flag never blocks target processing, since
    /// every progress write also repairs the flip.
    async fn start_processing(&self, job_id: JobId) -> bool {
        match with_retry("mark_processing", &self.retry, || {
            self.jobs.mark_processing(job_id, Utc::now())
        })
        .await
        {
            Ok(()) => true,
            Err(e @ StorageError::NotFound(_)) | Err(e @ StorageError::Corrupt(_)) => {
                error!(
                    job_id = %job_id,
                    error = %e,
                    "job row unusable before processing, marking failed"
                );
                self.finish(job_id, JobState::Failed).await;
                false
            }
            Err(StorageError::Conflict(_)) => {
                // Already terminal: cancelled between admission and start.
                match self.jobs.fetch_job(job_id).await {
                    Ok(Some(row)) if row.state.is_terminal() => false,
                    _ => true,
                }
            }
            Err(e) => {
                warn!(
                    job_id = %job_id,
                    error = %e,
                    "could not flip job to processing, continuing anyway"
                );
                true
            }
        }
    }

    async fn finish(&self, job_id: JobId, state: JobState) {
        if let Err(e) = with_retry("mark_terminal", &self.retry, || {
            self.jobs.mark_terminal(job_id, state, Utc::now())
        })
        .await
        {
            warn!(
                job_id = %job_id,
                state = %state,
                error = %e,
                "terminal state write failed after retries"
            );
        }
    }
}
