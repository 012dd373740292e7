//! Step error taxonomy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Category of a step failure.
///
/// The runner resolves every collaborator error, timeout and liveness
/// violation into one of these before the orchestrator sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepErrorKind {
    /// Temporary collaborator problem (unavailable, timed out).
    TransientCollaboratorError,
    /// The collaborator rejected the request for good.
    PermanentCollaboratorError,
    /// A business decision, e.g. inventory unavailable.
    BusinessRuleFailure,
    /// A long-running step stopped sending heartbeats.
    StaleHeartbeat,
    /// A compensating action failed.
    CompensationError,
}

impl StepErrorKind {
    /// Returns true if the retry policy applies to this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StepErrorKind::TransientCollaboratorError | StepErrorKind::StaleHeartbeat
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepErrorKind::TransientCollaboratorError => "TransientCollaboratorError",
            StepErrorKind::PermanentCollaboratorError => "PermanentCollaboratorError",
            StepErrorKind::BusinessRuleFailure => "BusinessRuleFailure",
            StepErrorKind::StaleHeartbeat => "StaleHeartbeat",
            StepErrorKind::CompensationError => "CompensationError",
        }
    }
}

impl std::fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified step failure, stored in the durable log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::TransientCollaboratorError, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::PermanentCollaboratorError, message)
    }

    pub fn business_rule(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::BusinessRuleFailure, message)
    }

    /// No heartbeat arrived within `interval`.
    pub fn stale_heartbeat(interval: Duration) -> Self {
        Self::new(
            StepErrorKind::StaleHeartbeat,
            format!("no heartbeat within {interval:?}"),
        )
    }

    /// An attempt ran past its time limit. Timeouts are retryable.
    pub fn timed_out(limit: Duration) -> Self {
        Self::transient(format!("attempt timed out after {limit:?}"))
    }

    /// Wraps the cause of a failed compensating action.
    pub fn compensation(cause: &StepError) -> Self {
        Self::new(StepErrorKind::CompensationError, cause.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
