//! Saga definitions: the ordered steps of a saga type and their policies.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::events::PlannedStep;
use crate::retry::{RetryPolicy, duration_millis, option_duration_millis};

/// Timeouts applied to each attempt of a step's action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Maximum duration of a single attempt.
    #[serde(with = "duration_millis")]
    pub start_to_close: Duration,

    /// Maximum duration of all attempts together, backoff included.
    #[serde(with = "duration_millis")]
    pub schedule_to_close: Duration,

    /// Maximum time between heartbeats (None = no heartbeat required)
    #[serde(with = "option_duration_millis")]
    pub heartbeat_interval: Option<Duration>,
}

impl TimeoutConfig {
    /// Short calls: 20 second attempts within one minute.
    pub fn quick() -> Self {
        Self {
            start_to_close: Duration::from_secs(20),
            schedule_to_close: Duration::from_secs(60),
            heartbeat_interval: None,
        }
    }

    /// Long-running shipping: 15 minute attempts within one hour,
    /// heartbeat at least every 15 seconds.
    pub fn shipping() -> Self {
        Self {
            start_to_close: Duration::from_secs(15 * 60),
            schedule_to_close: Duration::from_secs(60 * 60),
            heartbeat_interval: Some(Duration::from_secs(15)),
        }
    }

    /// Compensating actions: 30 second attempts within two minutes.
    pub fn compensation() -> Self {
        Self {
            start_to_close: Duration::from_secs(30),
            schedule_to_close: Duration::from_secs(2 * 60),
            heartbeat_interval: None,
        }
    }

    /// Set start-to-close timeout
    pub fn with_start_to_close(mut self, timeout: Duration) -> Self {
        self.start_to_close = timeout;
        self
    }

    /// Set schedule-to-close timeout
    pub fn with_schedule_to_close(mut self, timeout: Duration) -> Self {
        self.schedule_to_close = timeout;
        self
    }

    /// Set heartbeat interval
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Bound for one attempt, given what is left of the schedule-to-close budget.
    pub fn attempt_timeout(&self, elapsed: Duration) -> Duration {
        self.start_to_close
            .min(self.schedule_to_close.saturating_sub(elapsed))
    }
}

/// How the orchestrator launches a step's forward action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Awaited in place.
    #[default]
    Inline,
    /// Spawned as a cancellable task and joined later.
    Background,
}

/// One step of a saga definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    /// Name of the forward action.
    pub name: String,

    /// Name of the compensating action, if the step can be undone.
    pub compensation: Option<String>,

    /// Timeouts of each forward attempt.
    pub timeouts: TimeoutConfig,

    /// Retry policy of the forward action.
    pub retry: RetryPolicy,

    /// Inline or background execution.
    #[serde(default)]
    pub mode: ExecutionMode,
}

impl StepSpec {
    /// Creates an inline step with the quick timeouts and transient retry.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            compensation: None,
            timeouts: TimeoutConfig::quick(),
            retry: RetryPolicy::transient(),
            mode: ExecutionMode::Inline,
        }
    }

    /// Sets the compensating action.
    pub fn with_compensation(mut self, compensation: impl Into<String>) -> Self {
        self.compensation = Some(compensation.into());
        self
    }

    /// Sets the timeouts.
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Runs the forward action as a background task.
    pub fn in_background(mut self) -> Self {
        self.mode = ExecutionMode::Background;
        self
    }

    /// Returns true if the step emits heartbeats.
    pub fn heartbeats(&self) -> bool {
        self.timeouts.heartbeat_interval.is_some()
    }
}

/// The immutable ordered step list of one saga type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SagaDefinition {
    saga_type: String,
    steps: Vec<StepSpec>,
    compensation_timeouts: TimeoutConfig,
}

impl SagaDefinition {
    /// Creates an empty definition using the shared compensation policy.
    pub fn new(saga_type: impl Into<String>) -> Self {
        Self {
            saga_type: saga_type.into(),
            steps: Vec::new(),
            compensation_timeouts: TimeoutConfig::compensation(),
        }
    }

    /// Appends a step.
    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Overrides the timeouts of compensating actions.
    pub fn with_compensation_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.compensation_timeouts = timeouts;
        self
    }

    /// Checks that the definition has steps and that names are unique.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.steps.is_empty() {
            return Err(DomainError::InvalidDefinition(format!(
                "saga type '{}' has no steps",
                self.saga_type
            )));
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name.as_str()) {
                return Err(DomainError::InvalidDefinition(format!(
                    "duplicate step '{}' in saga type '{}'",
                    step.name, self.saga_type
                )));
            }
            if step.retry.max_attempts == 0 {
                return Err(DomainError::InvalidDefinition(format!(
                    "step '{}' allows zero attempts",
                    step.name
                )));
            }
        }
        Ok(())
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    /// Returns the step at `index`.
    pub fn get(&self, index: usize) -> Option<&StepSpec> {
        self.steps.get(index)
    }

    /// Finds a step by name.
    pub fn find(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Timeouts of every compensating action.
    pub fn compensation_timeouts(&self) -> &TimeoutConfig {
        &self.compensation_timeouts
    }

    /// Retry policy of every compensating action (one attempt).
    pub fn compensation_retry(&self) -> RetryPolicy {
        RetryPolicy::no_retry()
    }

    /// The step list as recorded in `SagaStarted`.
    pub fn planned_steps(&self) -> Vec<PlannedStep> {
        self.steps
            .iter()
            .map(|s| PlannedStep {
                name: s.name.clone(),
                compensation: s.compensation.clone(),
            })
            .collect()
    }
}
