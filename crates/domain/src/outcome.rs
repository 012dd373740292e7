//! Final results of a saga.

use serde::{Deserialize, Serialize};

use crate::failure::StepError;

/// Result of one compensating action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "error")]
pub enum CompensationOutcome {
    Compensated,
    Failed(StepError),
}

impl CompensationOutcome {
    pub fn is_compensated(&self) -> bool {
        matches!(self, CompensationOutcome::Compensated)
    }
}

/// The compensation outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationResult {
    /// The forward step that was compensated.
    pub step: String,
    pub outcome: CompensationOutcome,
}

/// Why a saga failed and how the rollback went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaFailure {
    /// The step whose terminal failure started compensation.
    pub failed_step: String,

    /// The classified error of that step.
    pub cause: StepError,

    /// Compensations in the order they ran.
    pub compensations: Vec<CompensationResult>,

    /// Whether the failure notification reached the customer.
    pub customer_notified: bool,
}

/// Terminal result of a saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum SagaOutcome {
    Completed { tracking_id: Option<String> },
    Failed(SagaFailure),
}

impl SagaOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SagaOutcome::Completed { .. })
    }

    /// Returns the tracking id of a completed saga.
    pub fn tracking_id(&self) -> Option<&str> {
        match self {
            SagaOutcome::Completed { tracking_id } => tracking_id.as_deref(),
            SagaOutcome::Failed(_) => None,
        }
    }

    /// Returns the failure details of a failed saga.
    pub fn failure(&self) -> Option<&SagaFailure> {
        match self {
            SagaOutcome::Completed { .. } => None,
            SagaOutcome::Failed(failure) => Some(failure),
        }
    }
}
