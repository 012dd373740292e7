//! Domain layer of the saga orchestrator.
//!
//! This crate provides the pieces the orchestrator folds and decides with:
//! - Aggregate trait for state rebuilt from the durable log
//! - Saga definitions: ordered steps with timeouts, retry policies and
//!   compensations
//! - The step error taxonomy and retry decisions
//! - `SagaInstance`, the saga state machine, and its `NextAction`

pub mod aggregate;
pub mod definition;
pub mod error;
pub mod events;
pub mod failure;
pub mod instance;
pub mod outcome;
pub mod retry;
pub mod status;
pub mod step;

pub use aggregate::{Aggregate, DomainEvent};
pub use definition::{ExecutionMode, SagaDefinition, StepSpec, TimeoutConfig};
pub use error::DomainError;
pub use events::{PlannedStep, SagaEvent};
pub use failure::{StepError, StepErrorKind};
pub use instance::{FailureInfo, NextAction, SagaInstance};
pub use outcome::{CompensationOutcome, CompensationResult, SagaFailure, SagaOutcome};
pub use retry::{RetryDecision, RetryPolicy};
pub use status::SagaStatus;
pub use step::{StepRecord, StepStatus};
