//! Domain error types.

use durable_log::{DurableLogError, RecordType};
use thiserror::Error;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the durable log.
    #[error("Durable log error: {0}")]
    Log(#[from] DurableLogError),

    /// The event is not allowed in the saga's current state.
    #[error("Invalid transition {event} for saga {saga_id}: {reason}")]
    InvalidTransition {
        saga_id: String,
        event: &'static str,
        reason: String,
    },

    /// The event names a step the saga does not have.
    #[error("Unknown step '{0}'")]
    UnknownStep(String),

    /// A record's type does not match its payload.
    #[error("Record type mismatch: record says {record}, payload is {payload}")]
    RecordMismatch {
        record: RecordType,
        payload: RecordType,
    },

    /// A saga definition is malformed.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
