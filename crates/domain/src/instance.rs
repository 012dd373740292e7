//! The saga instance state machine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::SagaId;
use durable_log::{LogRecord, SequenceNo, Snapshot};
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::error::DomainError;
use crate::events::SagaEvent;
use crate::failure::{StepError, StepErrorKind};
use crate::outcome::{CompensationOutcome, CompensationResult, SagaFailure, SagaOutcome};
use crate::status::SagaStatus;
use crate::step::{StepRecord, StepStatus};

/// What the orchestrator has to do next to drive a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Persist `SagaStarted`.
    Start,
    /// Run (or re-drive) the forward action of step `i`.
    RunStep(usize),
    /// Step `i` failed terminally; persist `SagaCompensating`.
    BeginCompensation(usize),
    /// Run the compensating action of step `i`.
    Compensate(usize),
    /// Send the failure notification.
    NotifyFailure,
    /// Persist `SagaCompleted`.
    Complete,
    /// Persist `SagaFailed`.
    Fail,
    /// The saga is terminal.
    Finished,
}

/// The step failure that started compensation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub failed_step: String,
    pub error: StepError,
}

/// One saga execution, rebuilt from the durable log.
///
/// The instance is the single source of truth for where a saga stands.
/// Every change goes through [`Aggregate::check`] and is persisted before
/// [`Aggregate::apply`] runs, so folding the log always reproduces it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    id: Option<SagaId>,
    sequence: SequenceNo,
    saga_type: String,
    status: SagaStatus,
    steps: Vec<StepRecord>,
    failure: Option<FailureInfo>,
    failure_notified: Option<bool>,
    tracking_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl Aggregate for SagaInstance {
    type Event = SagaEvent;
    type Error = DomainError;

    fn id(&self) -> Option<&SagaId> {
        self.id.as_ref()
    }

    fn sequence(&self) -> SequenceNo {
        self.sequence
    }

    fn set_sequence(&mut self, sequence: SequenceNo) {
        self.sequence = sequence;
    }

    fn check(&self, event: &SagaEvent) -> Result<(), DomainError> {
        let invalid = |reason: String| DomainError::InvalidTransition {
            saga_id: self.id.as_ref().map(ToString::to_string).unwrap_or_default(),
            event: event.name(),
            reason,
        };

        if let SagaEvent::SagaStarted(data) = event {
            if self.status != SagaStatus::NotStarted {
                return Err(invalid("saga already started".into()));
            }
            if data.steps.is_empty() {
                return Err(invalid("saga has no steps".into()));
            }
            return Ok(());
        }

        let expect_status = |expected: SagaStatus| {
            if self.status == expected {
                Ok(())
            } else {
                Err(invalid(format!("saga is {}, expected {expected}", self.status)))
            }
        };

        match event {
            SagaEvent::SagaStarted(_) => Ok(()),
            SagaEvent::StepStarted(data) => {
                expect_status(SagaStatus::Running)?;
                let (index, step) = self.find_step(&data.step)?;
                if let Some(earlier) = self.steps[..index]
                    .iter()
                    .find(|s| s.status != StepStatus::Succeeded)
                {
                    return Err(invalid(format!(
                        "earlier step '{}' is {}",
                        earlier.name, earlier.status
                    )));
                }
                if !step.can_start() {
                    return Err(invalid(format!("step '{}' is {}", step.name, step.status)));
                }
                if data.attempt != step.attempt + 1 {
                    return Err(invalid(format!(
                        "attempt {} does not follow attempt {}",
                        data.attempt, step.attempt
                    )));
                }
                Ok(())
            }
            SagaEvent::StepHeartbeat(data) => {
                expect_status(SagaStatus::Running)?;
                self.expect_running_attempt(&data.step, data.attempt, invalid)
            }
            SagaEvent::StepSucceeded(data) => {
                expect_status(SagaStatus::Running)?;
                self.expect_running_attempt(&data.step, data.attempt, invalid)
            }
            SagaEvent::StepFailed(data) => {
                expect_status(SagaStatus::Running)?;
                self.expect_running_attempt(&data.step, data.attempt, invalid)
            }
            SagaEvent::SagaCompensating(data) => {
                if !self.status.can_compensate() {
                    return Err(invalid(format!("saga is {}", self.status)));
                }
                let (_, step) = self.find_step(&data.failed_step)?;
                if !step.is_terminally_failed() {
                    return Err(invalid(format!(
                        "step '{}' has not failed terminally",
                        step.name
                    )));
                }
                Ok(())
            }
            SagaEvent::CompensationStarted(data) => {
                expect_status(SagaStatus::Compensating)?;
                let (_, step) = self.find_step(&data.step)?;
                if !step.needs_compensation() {
                    return Err(invalid(format!(
                        "step '{}' is {} and cannot be compensated",
                        step.name, step.status
                    )));
                }
                Ok(())
            }
            SagaEvent::CompensationFinished(data) => {
                expect_status(SagaStatus::Compensating)?;
                let (_, step) = self.find_step(&data.step)?;
                if step.status != StepStatus::Compensating {
                    return Err(invalid(format!("step '{}' is {}", step.name, step.status)));
                }
                Ok(())
            }
            SagaEvent::FailureNotified(_) => {
                expect_status(SagaStatus::Compensating)?;
                if self.failure_notified.is_some() {
                    return Err(invalid("failure notification already attempted".into()));
                }
                Ok(())
            }
            SagaEvent::SagaCompleted(_) => {
                expect_status(SagaStatus::Running)?;
                if let Some(step) = self
                    .steps
                    .iter()
                    .find(|s| s.status != StepStatus::Succeeded)
                {
                    return Err(invalid(format!("step '{}' is {}", step.name, step.status)));
                }
                Ok(())
            }
            SagaEvent::SagaFailed(_) => {
                expect_status(SagaStatus::Compensating)?;
                if let Some(step) = self.steps.iter().find(|s| s.needs_compensation()) {
                    return Err(invalid(format!(
                        "step '{}' still awaits compensation",
                        step.name
                    )));
                }
                if self.failure_notified.is_none() {
                    return Err(invalid("failure notification not attempted".into()));
                }
                Ok(())
            }
        }
    }

    fn apply(&mut self, event: SagaEvent) {
        match event {
            SagaEvent::SagaStarted(data) => {
                self.id = Some(data.saga_id);
                self.saga_type = data.saga_type;
                self.steps = data
                    .steps
                    .into_iter()
                    .map(|s| StepRecord::pending(s.name, s.compensation))
                    .collect();
                self.status = SagaStatus::Running;
                self.created_at = Some(data.started_at);
            }
            SagaEvent::StepStarted(data) => {
                if let Some(step) = self.step_mut(&data.step) {
                    step.status = StepStatus::Running;
                    step.attempt = data.attempt;
                    step.terminal = false;
                    step.last_heartbeat_at = None;
                    step.last_heartbeat_details = None;
                }
            }
            SagaEvent::StepHeartbeat(data) => {
                if let Some(step) = self.step_mut(&data.step) {
                    step.last_heartbeat_at = Some(data.at);
                    step.last_heartbeat_details = data.details;
                }
            }
            SagaEvent::StepSucceeded(data) => {
                if let Some(step) = self.step_mut(&data.step) {
                    step.status = StepStatus::Succeeded;
                    step.result = Some(data.result);
                }
            }
            SagaEvent::StepFailed(data) => {
                if let Some(step) = self.step_mut(&data.step) {
                    step.status = StepStatus::Failed;
                    step.last_error = Some(data.error);
                    step.terminal = data.terminal;
                }
            }
            SagaEvent::SagaCompensating(data) => {
                self.status = SagaStatus::Compensating;
                self.failure = Some(FailureInfo {
                    failed_step: data.failed_step,
                    error: data.error,
                });
            }
            SagaEvent::CompensationStarted(data) => {
                if let Some(step) = self.step_mut(&data.step) {
                    step.status = StepStatus::Compensating;
                }
            }
            SagaEvent::CompensationFinished(data) => {
                if let Some(step) = self.step_mut(&data.step) {
                    match data.outcome {
                        CompensationOutcome::Compensated => {
                            step.status = StepStatus::Compensated;
                        }
                        CompensationOutcome::Failed(error) => {
                            step.status = StepStatus::CompensationFailed;
                            step.compensation_error = Some(error);
                        }
                    }
                }
            }
            SagaEvent::FailureNotified(data) => {
                self.failure_notified = Some(data.delivered);
            }
            SagaEvent::SagaCompleted(data) => {
                self.status = SagaStatus::Completed;
                self.tracking_id = data.tracking_id;
            }
            SagaEvent::SagaFailed(_) => {
                self.status = SagaStatus::Failed;
            }
        }
    }

    fn record_applied(&mut self, record: &LogRecord) {
        if self.created_at.is_none() {
            self.created_at = Some(record.timestamp);
        }
        self.updated_at = Some(record.timestamp);
    }
}

impl SagaInstance {
    /// Rebuilds an instance from an optional snapshot and the records after it.
    ///
    /// Returns None when there is nothing to fold.
    pub fn restore(
        snapshot: Option<Snapshot>,
        records: Vec<LogRecord>,
    ) -> Result<Option<Self>, DomainError> {
        let mut instance = match snapshot {
            Some(snapshot) => snapshot.into_state::<SagaInstance>()?,
            None => SagaInstance::default(),
        };
        instance.replay(records)?;

        Ok(instance.id.is_some().then_some(instance))
    }

    /// Serializes the instance into a snapshot at its current sequence number.
    pub fn to_snapshot(&self) -> Result<Snapshot, DomainError> {
        let saga_id = self.id.clone().ok_or_else(|| DomainError::InvalidTransition {
            saga_id: String::new(),
            event: "Snapshot",
            reason: "saga not started".into(),
        })?;
        Ok(Snapshot::from_state(
            saga_id,
            self.saga_type.clone(),
            self.sequence,
            self,
        )?)
    }

    /// Returns what the orchestrator must do next.
    ///
    /// Pure function of the folded state, so a fresh run and a run resumed
    /// after a crash take the same decisions. A step left `Running` or
    /// non-terminally `Failed` is re-driven; a step left `Compensating` is
    /// compensated again.
    pub fn next_action(&self) -> NextAction {
        match self.status {
            SagaStatus::NotStarted => NextAction::Start,
            SagaStatus::Running => {
                match self
                    .steps
                    .iter()
                    .position(|s| s.status != StepStatus::Succeeded)
                {
                    None => NextAction::Complete,
                    Some(index) if self.steps[index].is_terminally_failed() => {
                        NextAction::BeginCompensation(index)
                    }
                    Some(index) => NextAction::RunStep(index),
                }
            }
            SagaStatus::Compensating => {
                // Strict reverse order of forward completion
                match self.steps.iter().rposition(StepRecord::needs_compensation) {
                    Some(index) => NextAction::Compensate(index),
                    None if self.failure_notified.is_none() => NextAction::NotifyFailure,
                    None => NextAction::Fail,
                }
            }
            SagaStatus::Completed | SagaStatus::Failed => NextAction::Finished,
        }
    }

    /// Returns the terminal outcome, or None while the saga is in flight.
    pub fn outcome(&self) -> Option<SagaOutcome> {
        match self.status {
            SagaStatus::Completed => Some(SagaOutcome::Completed {
                tracking_id: self.tracking_id.clone(),
            }),
            SagaStatus::Failed => self.failure.as_ref().map(|failure| {
                SagaOutcome::Failed(SagaFailure {
                    failed_step: failure.failed_step.clone(),
                    cause: failure.error.clone(),
                    compensations: self.compensations(),
                    customer_notified: self.failure_notified == Some(true),
                })
            }),
            _ => None,
        }
    }

    /// Finished compensations in the order they ran.
    pub fn compensations(&self) -> Vec<CompensationResult> {
        self.steps
            .iter()
            .rev()
            .filter(|s| s.status.is_compensation_settled())
            .map(|s| CompensationResult {
                step: s.name.clone(),
                outcome: match s.status {
                    StepStatus::Compensated => CompensationOutcome::Compensated,
                    _ => CompensationOutcome::Failed(s.compensation_error.clone().unwrap_or_else(
                        || StepError::new(StepErrorKind::CompensationError, "unknown"),
                    )),
                },
            })
            .collect()
    }

    /// Results of succeeded steps, keyed by step name.
    pub fn results(&self) -> HashMap<String, serde_json::Value> {
        self.steps
            .iter()
            .filter_map(|s| s.result.clone().map(|r| (s.name.clone(), r)))
            .collect()
    }

    pub fn saga_id(&self) -> Option<&SagaId> {
        self.id.as_ref()
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&StepRecord> {
        self.steps.get(index)
    }

    pub fn step_named(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn failure(&self) -> Option<&FailureInfo> {
        self.failure.as_ref()
    }

    /// None until the failure notification was attempted, then whether it
    /// was delivered.
    pub fn failure_notified(&self) -> Option<bool> {
        self.failure_notified
    }

    pub fn tracking_id(&self) -> Option<&str> {
        self.tracking_id.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn find_step(&self, name: &str) -> Result<(usize, &StepRecord), DomainError> {
        self.steps
            .iter()
            .enumerate()
            .find(|(_, s)| s.name == name)
            .ok_or_else(|| DomainError::UnknownStep(name.to_string()))
    }

    /// Results and heartbeats are only accepted from the attempt in flight.
    fn expect_running_attempt(
        &self,
        name: &str,
        attempt: u32,
        invalid: impl Fn(String) -> DomainError,
    ) -> Result<(), DomainError> {
        let (_, step) = self.find_step(name)?;
        if step.status != StepStatus::Running || step.attempt != attempt {
            return Err(invalid(format!(
                "attempt {attempt} of step '{name}' is not running"
            )));
        }
        Ok(())
    }

    fn step_mut(&mut self, name: &str) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.name == name)
    }
}
