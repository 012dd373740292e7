use thiserror::Error;

use crate::{SagaId, SequenceNo};

/// Errors that can occur when interacting with the durable log.
#[derive(Debug, Error)]
pub enum DurableLogError {
    /// Another writer appended to this saga first.
    /// The expected sequence number did not match the stored one.
    #[error(
        "Concurrency conflict for saga {saga_id}: expected sequence {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: SequenceNo,
        actual: SequenceNo,
    },

    /// The saga has no records in the log.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// The batch handed to `append` is malformed.
    #[error("Invalid append: {0}")]
    InvalidAppend(String),

    /// A record could not be built or decoded.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for durable log operations.
pub type Result<T> = std::result::Result<T, DurableLogError>;
