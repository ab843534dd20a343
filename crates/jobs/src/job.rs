//! Job record and state machine.

use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use marketsieve_core::{DomainError, DomainResult, Fingerprint, JobId, Symbol};

use crate::store::ProgressDelta;

/// Lifecycle state of a job.
///
/// Transitions are monotonic: `Queued → Processing → {Completed, Failed,
/// Cancelled}`, plus direct `Queued → {Failed, Cancelled}` for jobs that
/// never start. A terminal job is never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Active means a duplicate submission coalesces onto this job.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(DomainError::invalid_id(format!("JobState: {other:?}"))),
        }
    }
}

/// One target's recorded failure: which symbol, and what the evaluator said.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetError {
    pub symbol: Symbol,
    pub message: String,
}

/// Durable record of one batch-execution request plus its aggregate progress.
///
/// State is mutated only through methods, and only by the single executor
/// task that owns the job; pollers read concurrently through the store.
/// The target list itself is not persisted — the fingerprint identifies the
/// batch and `total` sizes it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job_id: JobId,
    pub state: JobState,
    pub fingerprint: Fingerprint,
    pub total: u32,
    pub completed: u32,
    pub succeeded: u32,
    pub errors: Vec<TargetError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// A freshly admitted job: queued, nothing processed.
    pub fn queued(
        job_id: JobId,
        fingerprint: Fingerprint,
        total: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            state: JobState::Queued,
            fingerprint,
            total,
            completed: 0,
            succeeded: 0,
            errors: Vec::new(),
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn failed_count(&self) -> u32 {
        self.errors.len() as u32
    }

    /// Flip `Queued → Processing` and stamp `started_at`.
    ///
    /// Idempotent when already processing (the flip is retried
    /// opportunistically from progress writes). Terminal jobs reject it.
    pub fn begin_processing(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        match self.state {
            JobState::Queued => {
                self.state = JobState::Processing;
                self.started_at = Some(at);
                Ok(())
            }
            JobState::Processing => Ok(()),
            terminal => Err(DomainError::conflict(format!(
                "cannot start processing a {terminal} job"
            ))),
        }
    }

    /// Apply one target's progress: counters, optional error, and — when the
    /// earlier status flip was lost — the `Queued → Processing` promotion.
    ///
    /// Enforces `completed <= total` and `succeeded <= completed`.
    pub fn apply_progress(&mut self, delta: &ProgressDelta, at: DateTime<Utc>) -> DomainResult<()> {
        if self.state.is_terminal() {
            return Err(DomainError::conflict(format!(
                "cannot record progress on a {} job",
                self.state
            )));
        }
        self.begin_processing(at)?;

        let completed = self.completed + delta.completed;
        if completed > self.total {
            return Err(DomainError::invariant(format!(
                "completed {completed} would exceed total {}",
                self.total
            )));
        }
        let succeeded = self.succeeded + delta.succeeded;
        if succeeded > completed {
            return Err(DomainError::invariant(format!(
                "succeeded {succeeded} would exceed completed {completed}"
            )));
        }

        self.completed = completed;
        self.succeeded = succeeded;
        if let Some(error) = &delta.error {
            self.errors.push(error.clone());
        }
        Ok(())
    }

    /// Move to a terminal state and stamp `completed_at`.
    ///
    /// Idempotent for a repeat of the same terminal state (a retried write
    /// whose first attempt actually committed); any other mutation of a
    /// terminal job is a conflict.
    pub fn finish(&mut self, state: JobState, at: DateTime<Utc>) -> DomainResult<()> {
        if !state.is_terminal() {
            return Err(DomainError::invariant(format!(
                "finish requires a terminal state, got {state}"
            )));
        }
        if self.state == state {
            return Ok(());
        }
        if self.state.is_terminal() {
            return Err(DomainError::conflict(format!(
                "job already terminal ({}), cannot move to {state}",
                self.state
            )));
        }
        self.state = state;
        self.completed_at = Some(at);
        Ok(())
    }
}
