//! Evaluator port: the external scoring function.
//!
//! Latency and internals are opaque to this crate. A failed call is a
//! per-target fact — recorded against the job, never fatal to the batch.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use marketsieve_core::Symbol;

use crate::store::OutcomeClass;

/// Recoverable per-target evaluation failure.
#[derive(Debug, Error)]
pub enum EvaluatorError {
    /// Upstream data missing or unusable for this symbol.
    #[error("no data for symbol: {0}")]
    NoData(String),

    /// The scoring backend processed the symbol but could not score it.
    #[error("scoring failed: {0}")]
    Scoring(String),

    /// The scoring backend could not be reached.
    #[error("evaluator unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of one successful evaluation.
///
/// The summary fields feed the hot-path result row; `payload` is the full
/// opaque output, stored separately and fetched lazily.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub outcome: OutcomeClass,
    pub score: f64,
    pub label: String,
    pub payload: JsonValue,
}

/// External scoring function, one symbol at a time.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, symbol: &Symbol) -> Result<Evaluation, EvaluatorError>;
}
