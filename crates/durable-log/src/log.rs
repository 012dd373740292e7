use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;

use crate::{
    DurableLogError, LogQuery, LogRecord, RecordType, Result, SagaId, SequenceNo, Snapshot,
};

/// Options for appending records to the log.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Expected last sequence number of the saga (compare-and-swap).
    /// If None, no check is performed (use with caution).
    pub expected_sequence: Option<SequenceNo>,
}

impl AppendOptions {
    /// Creates options with no sequence check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the saga to be at a specific sequence number.
    pub fn expect_sequence(sequence: SequenceNo) -> Self {
        Self {
            expected_sequence: Some(sequence),
        }
    }

    /// Creates options expecting the saga to have no records yet.
    pub fn expect_new() -> Self {
        Self {
            expected_sequence: Some(SequenceNo::initial()),
        }
    }
}

/// A stream of log records.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<LogRecord>> + Send>>;

/// Core trait for durable log implementations.
///
/// The log is append-only. All implementations must be thread-safe.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Appends records to one saga's log.
    ///
    /// Records are appended atomically - either all succeed or none do.
    /// If `options.expected_sequence` is set, the append fails with
    /// `ConcurrencyConflict` when the saga's last sequence number differs.
    ///
    /// Returns the sequence number of the last appended record.
    async fn append(&self, records: Vec<LogRecord>, options: AppendOptions) -> Result<SequenceNo>;

    /// Retrieves all records of a saga in sequence order.
    async fn read(&self, saga_id: &SagaId) -> Result<Vec<LogRecord>>;

    /// Retrieves the records of a saga starting at a sequence number (inclusive).
    async fn read_from(&self, saga_id: &SagaId, from: SequenceNo) -> Result<Vec<LogRecord>>;

    /// Retrieves records matching a query.
    async fn query(&self, query: LogQuery) -> Result<Vec<LogRecord>>;

    /// Retrieves records of one type across all sagas.
    async fn records_by_type(&self, record_type: RecordType) -> Result<Vec<LogRecord>>;

    /// Streams every record in insertion order.
    async fn stream_all(&self) -> Result<RecordStream>;

    /// Lists sagas whose last record is not terminal.
    ///
    /// These are the sagas a restarted orchestrator has to resume. The
    /// default folds [`stream_all`](Self::stream_all); backends that can
    /// look up the last record per saga directly should override it.
    async fn active_sagas(&self) -> Result<Vec<SagaId>> {
        let mut last: BTreeMap<SagaId, (SequenceNo, RecordType)> = BTreeMap::new();
        let mut stream = self.stream_all().await?;

        while let Some(record) = stream.next().await {
            let record = record?;
            let entry = last
                .entry(record.saga_id)
                .or_insert((record.sequence, record.record_type));
            if record.sequence >= entry.0 {
                *entry = (record.sequence, record.record_type);
            }
        }

        Ok(last
            .into_iter()
            .filter(|(_, (_, record_type))| !record_type.is_terminal())
            .map(|(saga_id, _)| saga_id)
            .collect())
    }

    /// Gets the last sequence number of a saga, or None if it has no records.
    async fn last_sequence(&self, saga_id: &SagaId) -> Result<Option<SequenceNo>>;

    /// Saves a snapshot of a saga. Replaces any previous snapshot.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    /// Retrieves the latest snapshot of a saga.
    async fn get_snapshot(&self, saga_id: &SagaId) -> Result<Option<Snapshot>>;
}

/// Extension trait providing convenience methods for durable logs.
#[async_trait]
pub trait DurableLogExt: DurableLog {
    /// Appends a single record.
    async fn append_record(&self, record: LogRecord, options: AppendOptions) -> Result<SequenceNo> {
        self.append(vec![record], options).await
    }

    /// Checks if a saga has any records.
    async fn saga_exists(&self, saga_id: &SagaId) -> Result<bool> {
        Ok(self.last_sequence(saga_id).await?.is_some())
    }

    /// Loads a saga's records, optionally starting from a snapshot.
    ///
    /// If a snapshot exists, returns it and the records written after it.
    /// Otherwise, returns None and all records.
    async fn load_saga(&self, saga_id: &SagaId) -> Result<(Option<Snapshot>, Vec<LogRecord>)> {
        if let Some(snapshot) = self.get_snapshot(saga_id).await? {
            let records = self.read_from(saga_id, snapshot.sequence.next()).await?;
            Ok((Some(snapshot), records))
        } else {
            let records = self.read(saga_id).await?;
            Ok((None, records))
        }
    }
}

// Blanket implementation for all DurableLog implementations
impl<T: DurableLog + ?Sized> DurableLogExt for T {}

/// Validates a batch before appending.
///
/// The batch must be non-empty, belong to a single saga, and carry
/// consecutive sequence numbers.
pub fn validate_records_for_append(records: &[LogRecord]) -> Result<()> {
    let Some(first) = records.first() else {
        return Err(DurableLogError::InvalidAppend(
            "Cannot append empty record list".to_string(),
        ));
    };

    for record in records.iter().skip(1) {
        if record.saga_id != first.saga_id {
            return Err(DurableLogError::InvalidAppend(
                "All records must be for the same saga".to_string(),
            ));
        }
    }

    let mut expected = first.sequence;
    for record in records.iter().skip(1) {
        expected = expected.next();
        if record.sequence != expected {
            return Err(DurableLogError::InvalidAppend(format!(
                "Record sequence numbers must be consecutive. Expected {}, got {}",
                expected, record.sequence
            )));
        }
    }

    if first.sequence < SequenceNo::first() {
        return Err(DurableLogError::InvalidAppend(format!(
            "Sequence numbers start at 1, got {}",
            first.sequence
        )));
    }

    Ok(())
}
