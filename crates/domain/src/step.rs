//! Per-step progress records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::failure::StepError;

/// Status of one step within a saga instance.
///
/// ```text
/// Pending ──► Running ──┬──► Succeeded ──► Compensating ──┬──► Compensated
///               ▲       │                                 └──► CompensationFailed
///               └───────┴──► Failed (retryable)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Compensating,
    Compensated,
    CompensationFailed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "Pending",
            StepStatus::Running => "Running",
            StepStatus::Succeeded => "Succeeded",
            StepStatus::Failed => "Failed",
            StepStatus::Compensating => "Compensating",
            StepStatus::Compensated => "Compensated",
            StepStatus::CompensationFailed => "CompensationFailed",
        }
    }

    /// Returns true once the compensating action has run to an outcome.
    pub fn is_compensation_settled(&self) -> bool {
        matches!(
            self,
            StepStatus::Compensated | StepStatus::CompensationFailed
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one step, mirroring a `StepSpec` of the definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,

    /// Name of the compensating action, copied from the definition.
    pub compensation: Option<String>,

    pub status: StepStatus,

    /// Number of forward attempts started so far.
    pub attempt: u32,

    pub last_heartbeat_at: Option<DateTime<Utc>>,

    pub last_heartbeat_details: Option<serde_json::Value>,

    /// Result of the successful forward action.
    pub result: Option<serde_json::Value>,

    /// Error of the last failed forward attempt.
    pub last_error: Option<StepError>,

    /// Set on a `Failed` step that will not be retried.
    pub terminal: bool,

    /// Error of the compensating action, when it failed.
    pub compensation_error: Option<StepError>,
}

impl StepRecord {
    /// Creates a pending record.
    pub fn pending(name: impl Into<String>, compensation: Option<String>) -> Self {
        Self {
            name: name.into(),
            compensation,
            status: StepStatus::Pending,
            attempt: 0,
            last_heartbeat_at: None,
            last_heartbeat_details: None,
            result: None,
            last_error: None,
            terminal: false,
            compensation_error: None,
        }
    }

    /// Returns true if the forward action may start another attempt.
    pub fn can_start(&self) -> bool {
        match self.status {
            StepStatus::Pending | StepStatus::Running => true,
            StepStatus::Failed => !self.terminal,
            _ => false,
        }
    }

    /// Returns true if this step failed and will not be retried.
    pub fn is_terminally_failed(&self) -> bool {
        self.status == StepStatus::Failed && self.terminal
    }

    /// Returns true if the orchestrator still owes this step a compensation.
    ///
    /// A step left `Compensating` by a crash is owed one as well, since
    /// compensating actions are idempotent.
    pub fn needs_compensation(&self) -> bool {
        self.compensation.is_some()
            && matches!(self.status, StepStatus::Succeeded | StepStatus::Compensating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_record_can_start() {
        let record = StepRecord::pending("processPayment", Some("refundPayment".into()));
        assert_eq!(record.status, StepStatus::Pending);
        assert_eq!(record.attempt, 0);
        assert!(record.can_start());
        assert!(!record.needs_compensation());
    }

    #[test]
    fn terminal_failure_cannot_start() {
        let mut record = StepRecord::pending("checkInventory", Some("restockInventory".into()));
        record.status = StepStatus::Failed;
        assert!(record.can_start());

        record.terminal = true;
        assert!(!record.can_start());
        assert!(record.is_terminally_failed());
    }

    #[test]
    fn only_succeeded_steps_with_compensation_are_owed_one() {
        let mut record = StepRecord::pending("shipOrder", Some("cancelShipment".into()));
        record.status = StepStatus::Succeeded;
        assert!(record.needs_compensation());

        record.status = StepStatus::Compensated;
        assert!(!record.needs_compensation());
        assert!(record.status.is_compensation_settled());

        let mut notify = StepRecord::pending("notifyCustomer", None);
        notify.status = StepStatus::Succeeded;
        assert!(!notify.needs_compensation());
    }
}
