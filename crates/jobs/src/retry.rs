//! Bounded retry-with-backoff for individual storage operations.
//!
//! One combinator, used uniformly by the creator, executor, duplicate
//! guard, and result writer — retry policy is defined once and audited
//! once, instead of scattered per-call-site loops.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::store::StorageError;

/// Retry policy for one storage operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1).
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per subsequent retry.
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
        }
    }

    /// Delay before the retry following failed attempt number `attempt`
    /// (1-indexed): `base * 2^(attempt-1)`, capped at 10s.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let pow = 1u32 << attempt.saturating_sub(1).min(10);
        let ms = self.base_backoff.as_millis().saturating_mul(pow as u128);
        Duration::from_millis(ms.min(10_000) as u64)
    }
}

/// Run `op`, retrying transient storage failures up to the policy's bound.
///
/// Permanent errors surface immediately; exhaustion surfaces the last
/// transient error. Each absorbed failure logs the operation label and
/// attempt number.
pub async fn with_retry<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    op = label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient storage failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
