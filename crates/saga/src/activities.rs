//! The seam between the orchestrator and a saga's actions.

use async_trait::async_trait;
use common::SagaId;
use domain::{SagaInstance, StepError};

use crate::context::StepContext;

/// Forward and compensating actions of one saga type, addressed by step
/// name.
///
/// Implementations classify every failure into a [`StepError`]; the runner
/// decides on retries from its kind.
#[async_trait]
pub trait SagaActivities: Send + Sync {
    /// Runs the forward action of `step` and returns its result.
    async fn execute(&self, step: &str, ctx: StepContext) -> Result<serde_json::Value, StepError>;

    /// Runs the compensating action of the forward step `step`.
    async fn compensate(&self, step: &str, ctx: StepContext) -> Result<(), StepError>;

    /// Tells the customer the saga failed.
    async fn notify_failure(&self, saga_id: &SagaId, reason: &str) -> Result<(), StepError>;

    /// Extracts the tracking id reported in the final outcome.
    fn tracking_id(&self, _instance: &SagaInstance) -> Option<String> {
        None
    }
}
