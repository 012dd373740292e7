//! Saga transitions, one per durable log record.

use chrono::{DateTime, Utc};
use common::SagaId;
use durable_log::RecordType;
use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;
use crate::failure::StepError;
use crate::outcome::CompensationOutcome;

/// Transitions of a saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    SagaStarted(SagaStartedData),
    StepStarted(StepStartedData),
    StepHeartbeat(StepHeartbeatData),
    StepSucceeded(StepSucceededData),
    StepFailed(StepFailedData),
    /// A step failed terminally; compensation begins.
    SagaCompensating(SagaCompensatingData),
    CompensationStarted(StepData),
    CompensationFinished(CompensationFinishedData),
    /// The failure notification was attempted.
    FailureNotified(FailureNotifiedData),
    SagaCompleted(SagaCompletedData),
    SagaFailed(SagaFailedData),
}

impl DomainEvent for SagaEvent {
    fn record_type(&self) -> RecordType {
        match self {
            SagaEvent::SagaStarted(_) => RecordType::SagaStarted,
            SagaEvent::StepStarted(_) => RecordType::StepStarted,
            SagaEvent::StepHeartbeat(_) => RecordType::StepHeartbeat,
            SagaEvent::StepSucceeded(_) => RecordType::StepSucceeded,
            SagaEvent::StepFailed(_) => RecordType::StepFailed,
            SagaEvent::SagaCompensating(_) => RecordType::SagaCompensating,
            SagaEvent::CompensationStarted(_) => RecordType::CompensationStarted,
            SagaEvent::CompensationFinished(_) => RecordType::CompensationFinished,
            SagaEvent::FailureNotified(_) => RecordType::FailureNotified,
            SagaEvent::SagaCompleted(_) => RecordType::SagaCompleted,
            SagaEvent::SagaFailed(_) => RecordType::SagaFailed,
        }
    }

    fn step_name(&self) -> Option<&str> {
        match self {
            SagaEvent::StepStarted(data) => Some(&data.step),
            SagaEvent::StepHeartbeat(data) => Some(&data.step),
            SagaEvent::StepSucceeded(data) => Some(&data.step),
            SagaEvent::StepFailed(data) => Some(&data.step),
            SagaEvent::SagaCompensating(data) => Some(&data.failed_step),
            SagaEvent::CompensationStarted(data) => Some(&data.step),
            SagaEvent::CompensationFinished(data) => Some(&data.step),
            SagaEvent::SagaStarted(_)
            | SagaEvent::FailureNotified(_)
            | SagaEvent::SagaCompleted(_)
            | SagaEvent::SagaFailed(_) => None,
        }
    }
}

/// A step as planned when the saga started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub name: String,
    pub compensation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStartedData {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub steps: Vec<PlannedStep>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepData {
    pub step: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStartedData {
    pub step: String,
    /// 1-based attempt number.
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepHeartbeatData {
    pub step: String,
    pub attempt: u32,
    pub details: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSucceededData {
    pub step: String,
    pub attempt: u32,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step: String,
    pub attempt: u32,
    pub error: StepError,
    /// No further attempt will run.
    pub terminal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaCompensatingData {
    pub failed_step: String,
    pub error: StepError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationFinishedData {
    pub step: String,
    pub outcome: CompensationOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNotifiedData {
    pub delivered: bool,
    pub error: Option<StepError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaCompletedData {
    pub tracking_id: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaFailedData {
    pub failed_step: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

// Convenience constructors
impl SagaEvent {
    pub fn saga_started(
        saga_id: SagaId,
        saga_type: impl Into<String>,
        steps: Vec<PlannedStep>,
    ) -> Self {
        SagaEvent::SagaStarted(SagaStartedData {
            saga_id,
            saga_type: saga_type.into(),
            steps,
            started_at: Utc::now(),
        })
    }

    pub fn step_started(step: impl Into<String>, attempt: u32) -> Self {
        SagaEvent::StepStarted(StepStartedData {
            step: step.into(),
            attempt,
        })
    }

    pub fn step_heartbeat(
        step: impl Into<String>,
        attempt: u32,
        details: Option<serde_json::Value>,
    ) -> Self {
        SagaEvent::StepHeartbeat(StepHeartbeatData {
            step: step.into(),
            attempt,
            details,
            at: Utc::now(),
        })
    }

    pub fn step_succeeded(step: impl Into<String>, attempt: u32, result: serde_json::Value) -> Self {
        SagaEvent::StepSucceeded(StepSucceededData {
            step: step.into(),
            attempt,
            result,
        })
    }

    pub fn step_failed(
        step: impl Into<String>,
        attempt: u32,
        error: StepError,
        terminal: bool,
    ) -> Self {
        SagaEvent::StepFailed(StepFailedData {
            step: step.into(),
            attempt,
            error,
            terminal,
        })
    }

    pub fn saga_compensating(failed_step: impl Into<String>, error: StepError) -> Self {
        SagaEvent::SagaCompensating(SagaCompensatingData {
            failed_step: failed_step.into(),
            error,
        })
    }

    pub fn compensation_started(step: impl Into<String>) -> Self {
        SagaEvent::CompensationStarted(StepData { step: step.into() })
    }

    pub fn compensation_finished(step: impl Into<String>, outcome: CompensationOutcome) -> Self {
        SagaEvent::CompensationFinished(CompensationFinishedData {
            step: step.into(),
            outcome,
        })
    }

    pub fn failure_notified(result: Result<(), StepError>) -> Self {
        SagaEvent::FailureNotified(FailureNotifiedData {
            delivered: result.is_ok(),
            error: result.err(),
        })
    }

    pub fn saga_completed(tracking_id: Option<String>) -> Self {
        SagaEvent::SagaCompleted(SagaCompletedData {
            tracking_id,
            completed_at: Utc::now(),
        })
    }

    pub fn saga_failed(failed_step: impl Into<String>, reason: impl Into<String>) -> Self {
        SagaEvent::SagaFailed(SagaFailedData {
            failed_step: failed_step.into(),
            reason: reason.into(),
            failed_at: Utc::now(),
        })
    }

    /// Returns the name of the variant, e.g. `"StepFailed"`.
    pub fn name(&self) -> &'static str {
        self.record_type().as_str()
    }
}
