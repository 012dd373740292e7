//! Core aggregate and domain event traits.

use common::SagaId;
use durable_log::{LogRecord, RecordType, SequenceNo};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::DomainError;

/// Trait for domain events.
///
/// Each event is stored as the payload of one durable log record. Events
/// are immutable facts and named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the record type the event is stored under.
    fn record_type(&self) -> RecordType;

    /// Returns the step the event concerns, if any.
    fn step_name(&self) -> Option<&str> {
        None
    }
}

/// Trait for state rebuilt from the durable log.
///
/// Aggregates:
/// - Check an event against the current state before it is persisted
/// - Apply events to update state (pure, deterministic)
/// - Are rebuilt after a restart by replaying their records
pub trait Aggregate: Default + Send + Sync + Sized {
    /// The type of events this aggregate produces and consumes.
    type Event: DomainEvent;

    /// The type of errors this aggregate can produce.
    type Error: std::error::Error + Send + Sync;

    /// Returns the aggregate's identifier, or None before it started.
    fn id(&self) -> Option<&SagaId>;

    /// Returns the sequence number of the last applied record.
    fn sequence(&self) -> SequenceNo;

    /// Sets the sequence number of the last applied record.
    fn set_sequence(&mut self, sequence: SequenceNo);

    /// Checks whether `event` is a legal transition from the current state.
    fn check(&self, event: &Self::Event) -> Result<(), Self::Error>;

    /// Applies an event to update the aggregate state.
    ///
    /// This method must be:
    /// - Pure (no side effects)
    /// - Deterministic (same event always produces same state change)
    /// - It must not fail (events represent facts that have happened)
    fn apply(&mut self, event: Self::Event);

    /// Applies multiple events in sequence.
    fn apply_events(&mut self, events: impl IntoIterator<Item = Self::Event>) {
        for event in events {
            self.apply(event);
        }
    }

    /// Hook called after a record has been applied.
    fn record_applied(&mut self, _record: &LogRecord) {}

    /// Decodes a record's payload and applies it.
    fn apply_record(&mut self, mut record: LogRecord) -> Result<(), DomainError> {
        let event: Self::Event = serde_json::from_value(std::mem::take(&mut record.payload))?;

        if event.record_type() != record.record_type {
            return Err(DomainError::RecordMismatch {
                record: record.record_type,
                payload: event.record_type(),
            });
        }

        self.apply(event);
        self.set_sequence(record.sequence);
        self.record_applied(&record);
        Ok(())
    }

    /// Folds records in sequence order.
    fn replay(&mut self, records: impl IntoIterator<Item = LogRecord>) -> Result<(), DomainError> {
        for record in records {
            self.apply_record(record)?;
        }
        Ok(())
    }
}
