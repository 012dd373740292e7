use chrono::{DateTime, Utc};

use crate::{LogRecord, RecordType, SagaId, SequenceNo};

/// Builder for constructing log queries.
///
/// Allows filtering records by saga, saga type, record type, step,
/// sequence range, and time range.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    /// Filter by saga ID.
    pub saga_id: Option<SagaId>,

    /// Filter by saga type.
    pub saga_type: Option<String>,

    /// Filter by record types (any of these types).
    pub record_types: Option<Vec<RecordType>>,

    /// Filter by step name.
    pub step_name: Option<String>,

    /// Filter by minimum sequence number (inclusive).
    pub from_sequence: Option<SequenceNo>,

    /// Filter by maximum sequence number (inclusive).
    pub to_sequence: Option<SequenceNo>,

    /// Filter by records after this timestamp (inclusive).
    pub from_timestamp: Option<DateTime<Utc>>,

    /// Filter by records before this timestamp (inclusive).
    pub to_timestamp: Option<DateTime<Utc>>,

    /// Maximum number of records to return.
    pub limit: Option<usize>,

    /// Number of records to skip.
    pub offset: Option<usize>,
}

impl LogQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for a specific saga.
    pub fn for_saga(saga_id: SagaId) -> Self {
        Self {
            saga_id: Some(saga_id),
            ..Default::default()
        }
    }

    /// Creates a query for records of a specific type.
    pub fn for_record_type(record_type: RecordType) -> Self {
        Self {
            record_types: Some(vec![record_type]),
            ..Default::default()
        }
    }

    /// Filters by saga ID.
    pub fn saga_id(mut self, id: SagaId) -> Self {
        self.saga_id = Some(id);
        self
    }

    /// Filters by saga type.
    pub fn saga_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }

    /// Filters by record type.
    pub fn record_type(mut self, record_type: RecordType) -> Self {
        self.record_types = Some(vec![record_type]);
        self
    }

    /// Filters by multiple record types (any of these).
    pub fn record_types(mut self, record_types: Vec<RecordType>) -> Self {
        self.record_types = Some(record_types);
        self
    }

    /// Filters by step name.
    pub fn step_name(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = Some(step_name.into());
        self
    }

    /// Filters to records starting from this sequence number (inclusive).
    pub fn from_sequence(mut self, sequence: SequenceNo) -> Self {
        self.from_sequence = Some(sequence);
        self
    }

    /// Filters to records up to this sequence number (inclusive).
    pub fn to_sequence(mut self, sequence: SequenceNo) -> Self {
        self.to_sequence = Some(sequence);
        self
    }

    /// Filters to records after this timestamp (inclusive).
    pub fn from_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.from_timestamp = Some(timestamp);
        self
    }

    /// Filters to records before this timestamp (inclusive).
    pub fn to_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.to_timestamp = Some(timestamp);
        self
    }

    /// Limits the number of records returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips this many records before returning results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if a record passes every filter of this query.
    ///
    /// Paging (`limit`/`offset`) is not applied here.
    pub fn matches(&self, record: &LogRecord) -> bool {
        if let Some(ref id) = self.saga_id
            && &record.saga_id != id
        {
            return false;
        }
        if let Some(ref saga_type) = self.saga_type
            && &record.saga_type != saga_type
        {
            return false;
        }
        if let Some(ref types) = self.record_types
            && !types.contains(&record.record_type)
        {
            return false;
        }
        if let Some(ref step) = self.step_name
            && record.step_name.as_ref() != Some(step)
        {
            return false;
        }
        if let Some(from) = self.from_sequence
            && record.sequence < from
        {
            return false;
        }
        if let Some(to) = self.to_sequence
            && record.sequence > to
        {
            return false;
        }
        if let Some(from) = self.from_timestamp
            && record.timestamp < from
        {
            return false;
        }
        if let Some(to) = self.to_timestamp
            && record.timestamp > to
        {
            return false;
        }
        true
    }
}
