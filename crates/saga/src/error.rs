//! Saga error types.

use common::SagaId;
use domain::DomainError;
use durable_log::DurableLogError;
use thiserror::Error;

/// Errors that stop the orchestrator from driving a saga.
///
/// Step failures are not errors at this level: they are recorded in the log
/// and resolved by retries or compensation.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Durable log error, including a lost compare-and-swap.
    #[error("Durable log error: {0}")]
    Log(#[from] DurableLogError),

    /// Domain error, e.g. an illegal transition.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The saga is already being driven by this process.
    #[error("Saga already running: {0}")]
    AlreadyRunning(SagaId),

    /// No saga with this id exists in the log.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// The log names a step the definition does not have.
    #[error("Unknown step: {0}")]
    UnknownStep(String),

    /// A spawned task ended without delivering its result.
    #[error("Task '{task}' aborted: {reason}")]
    TaskAborted { task: String, reason: String },

    /// The order id is empty.
    #[error("Invalid order id: {0:?}")]
    InvalidOrderId(String),

    /// The saga reached a terminal status without a readable outcome.
    #[error("Saga {0} finished without an outcome")]
    MissingOutcome(SagaId),
}

impl SagaError {
    /// Returns true if another writer advanced the saga's log first.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(
            self,
            SagaError::Log(DurableLogError::ConcurrencyConflict { .. })
                | SagaError::Domain(DomainError::Log(
                    DurableLogError::ConcurrencyConflict { .. }
                ))
        )
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
