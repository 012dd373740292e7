use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{DurableLogError, SagaId};

/// Unique identifier for a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Creates a new random record ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a record ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a record within one saga's log.
///
/// Sequence numbers start at 1 for the first record and increment by 1 for
/// each subsequent record of the same saga. `initial()` (0) means "no
/// records yet" and is what a writer expects when creating a saga.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceNo(i64);

impl SequenceNo {
    /// Creates a sequence number from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial sequence number (0) of a saga with no records.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the sequence number (1) of the first record.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next sequence number.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for SequenceNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SequenceNo {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<SequenceNo> for i64 {
    fn from(sequence: SequenceNo) -> Self {
        sequence.0
    }
}

/// Kind of transition a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    SagaStarted,
    StepStarted,
    StepHeartbeat,
    StepSucceeded,
    StepFailed,
    SagaCompensating,
    CompensationStarted,
    CompensationFinished,
    FailureNotified,
    SagaCompleted,
    SagaFailed,
}

impl RecordType {
    /// Every record type, in lifecycle order.
    pub const ALL: [RecordType; 11] = [
        RecordType::SagaStarted,
        RecordType::StepStarted,
        RecordType::StepHeartbeat,
        RecordType::StepSucceeded,
        RecordType::StepFailed,
        RecordType::SagaCompensating,
        RecordType::CompensationStarted,
        RecordType::CompensationFinished,
        RecordType::FailureNotified,
        RecordType::SagaCompleted,
        RecordType::SagaFailed,
    ];

    /// Returns the record type name as stored in the log.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::SagaStarted => "SagaStarted",
            RecordType::StepStarted => "StepStarted",
            RecordType::StepHeartbeat => "StepHeartbeat",
            RecordType::StepSucceeded => "StepSucceeded",
            RecordType::StepFailed => "StepFailed",
            RecordType::SagaCompensating => "SagaCompensating",
            RecordType::CompensationStarted => "CompensationStarted",
            RecordType::CompensationFinished => "CompensationFinished",
            RecordType::FailureNotified => "FailureNotified",
            RecordType::SagaCompleted => "SagaCompleted",
            RecordType::SagaFailed => "SagaFailed",
        }
    }

    /// Returns true if a record of this type ends a saga.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordType::SagaCompleted | RecordType::SagaFailed)
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = DurableLogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DurableLogError::InvalidRecord(format!("unknown record type '{s}'")))
    }
}

/// One entry of the durable log.
///
/// Wraps a serialized saga transition with everything needed to store it,
/// order it within its saga, and fold it back during recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Unique identifier for this record.
    pub record_id: RecordId,

    /// The saga this record belongs to.
    pub saga_id: SagaId,

    /// The saga definition the saga runs (e.g., "order-processing").
    pub saga_type: String,

    /// Position of this record within the saga's log.
    pub sequence: SequenceNo,

    /// When the record was written.
    pub timestamp: DateTime<Utc>,

    /// The kind of transition.
    pub record_type: RecordType,

    /// The step the transition concerns, if any.
    pub step_name: Option<String>,

    /// The transition payload as JSON.
    pub payload: serde_json::Value,

    /// Additional metadata about the record.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a new record builder.
    pub fn builder() -> LogRecordBuilder {
        LogRecordBuilder::default()
    }
}

/// Builder for constructing log records.
#[derive(Debug, Default)]
pub struct LogRecordBuilder {
    record_id: Option<RecordId>,
    saga_id: Option<SagaId>,
    saga_type: Option<String>,
    sequence: Option<SequenceNo>,
    timestamp: Option<DateTime<Utc>>,
    record_type: Option<RecordType>,
    step_name: Option<String>,
    payload: Option<serde_json::Value>,
    metadata: HashMap<String, serde_json::Value>,
}

impl LogRecordBuilder {
    /// Sets the record ID. If not set, a new ID will be generated.
    pub fn record_id(mut self, id: RecordId) -> Self {
        self.record_id = Some(id);
        self
    }

    /// Sets the saga ID.
    pub fn saga_id(mut self, id: SagaId) -> Self {
        self.saga_id = Some(id);
        self
    }

    /// Sets the saga type.
    pub fn saga_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }

    /// Sets the sequence number.
    pub fn sequence(mut self, sequence: SequenceNo) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the record type.
    pub fn record_type(mut self, record_type: RecordType) -> Self {
        self.record_type = Some(record_type);
        self
    }

    /// Sets the step name.
    pub fn step_name(mut self, step_name: Option<String>) -> Self {
        self.step_name = step_name;
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Builds the record.
    ///
    /// Fails with `InvalidRecord` naming the first missing required field
    /// (saga_id, saga_type, sequence, record_type, payload).
    pub fn build(self) -> crate::Result<LogRecord> {
        fn missing(field: &str) -> DurableLogError {
            DurableLogError::InvalidRecord(format!("{field} is required"))
        }

        Ok(LogRecord {
            record_id: self.record_id.unwrap_or_default(),
            saga_id: self.saga_id.ok_or_else(|| missing("saga_id"))?,
            saga_type: self.saga_type.ok_or_else(|| missing("saga_type"))?,
            sequence: self.sequence.ok_or_else(|| missing("sequence"))?,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            record_type: self.record_type.ok_or_else(|| missing("record_type"))?,
            step_name: self.step_name,
            payload: self.payload.ok_or_else(|| missing("payload"))?,
            metadata: self.metadata,
        })
    }

    /// Tries to build the record, returning None if required fields are missing.
    pub fn try_build(self) -> Option<LogRecord> {
        self.build().ok()
    }
}
