//! Caller-facing error taxonomy for the job subsystem.
//!
//! Only two failures surface synchronously to callers as hard errors:
//! invalid input and exhausted creation retries. A duplicate active job is
//! a *success* (`JobTicket { is_duplicate: true }`), and per-target
//! evaluation failures are recorded against the job, not raised here.

use thiserror::Error;

use marketsieve_core::JobId;

use crate::store::StorageError;

#[derive(Debug, Error)]
pub enum JobError {
    /// Invalid input (e.g. empty target list); storage was never touched.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The creation insert exhausted its retries. Disjoint from duplicate
    /// detection by construction: the guard runs before the insert, and
    /// the insert error path never consults the guard.
    #[error("job creation failed after retries")]
    CreationFailed(#[source] StorageError),

    /// The requested job does not exist.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A read needed to answer the caller failed even after retries.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
