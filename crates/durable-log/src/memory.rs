use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    DurableLogError, LogQuery, LogRecord, RecordType, Result, SagaId, SequenceNo, Snapshot,
    log::{AppendOptions, DurableLog, RecordStream, validate_records_for_append},
};

/// In-memory durable log.
///
/// Provides the same interface and concurrency checks as the PostgreSQL
/// implementation. Clones share the same storage, which lets tests simulate
/// an orchestrator restart by handing the log to a fresh orchestrator.
#[derive(Clone, Default)]
pub struct InMemoryDurableLog {
    records: Arc<RwLock<Vec<LogRecord>>>,
    snapshots: Arc<RwLock<HashMap<SagaId, Snapshot>>>,
}

impl InMemoryDurableLog {
    /// Creates a new empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log pre-populated with records, bypassing validation.
    ///
    /// Used to replay a truncated log after a simulated crash.
    pub fn from_records(records: Vec<LogRecord>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
            snapshots: Arc::default(),
        }
    }

    /// Returns the total number of records stored.
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl DurableLog for InMemoryDurableLog {
    async fn append(&self, records: Vec<LogRecord>, options: AppendOptions) -> Result<SequenceNo> {
        validate_records_for_append(&records)?;

        let first = &records[0];
        let saga_id = first.saga_id.clone();

        let mut store = self.records.write().await;

        let current = store
            .iter()
            .filter(|r| r.saga_id == saga_id)
            .map(|r| r.sequence)
            .max()
            .unwrap_or(SequenceNo::initial());

        if let Some(expected) = options.expected_sequence
            && current != expected
        {
            return Err(DurableLogError::ConcurrencyConflict {
                saga_id,
                expected,
                actual: current,
            });
        }

        // Unique (saga_id, sequence) constraint simulation
        if first.sequence != current.next() {
            return Err(DurableLogError::ConcurrencyConflict {
                saga_id,
                expected: options.expected_sequence.unwrap_or(current),
                actual: current,
            });
        }

        let last = records
            .last()
            .map(|r| r.sequence)
            .unwrap_or(SequenceNo::initial());
        let appended = records.len() as u64;
        store.extend(records);
        metrics::counter!("durable_log_appends_total").increment(appended);

        Ok(last)
    }

    async fn read(&self, saga_id: &SagaId) -> Result<Vec<LogRecord>> {
        let store = self.records.read().await;
        let mut records: Vec<_> = store
            .iter()
            .filter(|r| &r.saga_id == saga_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    async fn read_from(&self, saga_id: &SagaId, from: SequenceNo) -> Result<Vec<LogRecord>> {
        let store = self.records.read().await;
        let mut records: Vec<_> = store
            .iter()
            .filter(|r| &r.saga_id == saga_id && r.sequence >= from)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    async fn query(&self, query: LogQuery) -> Result<Vec<LogRecord>> {
        let store = self.records.read().await;
        let mut records: Vec<_> = store.iter().filter(|r| query.matches(r)).cloned().collect();

        // Sort by timestamp then sequence
        records.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.sequence.cmp(&b.sequence))
        });

        let offset = query.offset.unwrap_or(0);
        let records = records.into_iter().skip(offset);
        let records = match query.limit {
            Some(limit) => records.take(limit).collect(),
            None => records.collect(),
        };

        Ok(records)
    }

    async fn records_by_type(&self, record_type: RecordType) -> Result<Vec<LogRecord>> {
        let store = self.records.read().await;
        let mut records: Vec<_> = store
            .iter()
            .filter(|r| r.record_type == record_type)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }

    async fn stream_all(&self) -> Result<RecordStream> {
        use futures_util::stream;

        // Insertion order is the storage order
        let records = self.records.read().await.clone();
        let stream = stream::iter(records.into_iter().map(Ok));
        Ok(Box::pin(stream))
    }

    async fn last_sequence(&self, saga_id: &SagaId) -> Result<Option<SequenceNo>> {
        let store = self.records.read().await;
        Ok(store
            .iter()
            .filter(|r| &r.saga_id == saga_id)
            .map(|r| r.sequence)
            .max())
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(snapshot.saga_id.clone(), snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, saga_id: &SagaId) -> Result<Option<Snapshot>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(saga_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DurableLogExt;

    fn create_record(saga_id: &SagaId, sequence: i64, record_type: RecordType) -> LogRecord {
        LogRecord::builder()
            .saga_id(saga_id.clone())
            .saga_type("order-processing")
            .sequence(SequenceNo::new(sequence))
            .record_type(record_type)
            .payload_raw(serde_json::json!({"test": true}))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn append_single_record() {
        let log = InMemoryDurableLog::new();
        let saga_id = SagaId::new("ORDER-1");
        let record = create_record(&saga_id, 1, RecordType::SagaStarted);

        let result = log.append(vec![record], AppendOptions::expect_new()).await;
        assert_eq!(result.unwrap(), SequenceNo::first());

        let records = log.read(&saga_id).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn append_batch() {
        let log = InMemoryDurableLog::new();
        let saga_id = SagaId::new("ORDER-1");

        let records = vec![
            create_record(&saga_id, 1, RecordType::SagaStarted),
            create_record(&saga_id, 2, RecordType::StepStarted),
            create_record(&saga_id, 3, RecordType::StepSucceeded),
        ];

        let last = log.append(records, AppendOptions::expect_new()).await.unwrap();
        assert_eq!(last, SequenceNo::new(3));
        assert_eq!(log.read(&saga_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn second_writer_loses_compare_and_swap() {
        let log = InMemoryDurableLog::new();
        let saga_id = SagaId::new("ORDER-1");

        log.append(
            vec![create_record(&saga_id, 1, RecordType::SagaStarted)],
            AppendOptions::expect_new(),
        )
        .await
        .unwrap();

        // Both writers observed sequence 1; the first one wins
        log.append(
            vec![create_record(&saga_id, 2, RecordType::StepStarted)],
            AppendOptions::expect_sequence(SequenceNo::first()),
        )
        .await
        .unwrap();

        let result = log
            .append(
                vec![create_record(&saga_id, 2, RecordType::StepStarted)],
                AppendOptions::expect_sequence(SequenceNo::first()),
            )
            .await;

        assert!(matches!(
            result,
            Err(DurableLogError::ConcurrencyConflict { actual, .. }) if actual == SequenceNo::new(2)
        ));
    }

    #[tokio::test]
    async fn unchecked_append_still_rejects_duplicate_sequence() {
        let log = InMemoryDurableLog::new();
        let saga_id = SagaId::new("ORDER-1");
        let record = create_record(&saga_id, 1, RecordType::SagaStarted);

        log.append(vec![record.clone()], AppendOptions::new())
            .await
            .unwrap();
        let result = log.append(vec![record], AppendOptions::new()).await;

        assert!(matches!(
            result,
            Err(DurableLogError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn read_from_sequence() {
        let log = InMemoryDurableLog::new();
        let saga_id = SagaId::new("ORDER-1");

        let records = (1..=3)
            .map(|s| create_record(&saga_id, s, RecordType::StepHeartbeat))
            .collect();
        log.append(records, AppendOptions::new()).await.unwrap();

        let from_2 = log.read_from(&saga_id, SequenceNo::new(2)).await.unwrap();
        assert_eq!(from_2.len(), 2);
        assert_eq!(from_2[0].sequence, SequenceNo::new(2));
        assert_eq!(from_2[1].sequence, SequenceNo::new(3));
    }

    #[tokio::test]
    async fn records_by_type_spans_sagas() {
        let log = InMemoryDurableLog::new();
        let first = SagaId::new("ORDER-1");
        let second = SagaId::new("ORDER-2");

        log.append(
            vec![create_record(&first, 1, RecordType::SagaStarted)],
            AppendOptions::new(),
        )
        .await
        .unwrap();
        log.append(
            vec![create_record(&second, 1, RecordType::SagaStarted)],
            AppendOptions::new(),
        )
        .await
        .unwrap();
        log.append(
            vec![create_record(&first, 2, RecordType::SagaCompleted)],
            AppendOptions::new(),
        )
        .await
        .unwrap();

        let started = log.records_by_type(RecordType::SagaStarted).await.unwrap();
        assert_eq!(started.len(), 2);
        let completed = log.records_by_type(RecordType::SagaCompleted).await.unwrap();
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    async fn query_with_filters_and_paging() {
        let log = InMemoryDurableLog::new();
        let saga_id = SagaId::new("ORDER-1");

        let records = (1..=5)
            .map(|s| create_record(&saga_id, s, RecordType::StepHeartbeat))
            .collect();
        log.append(records, AppendOptions::new()).await.unwrap();

        let query = LogQuery::for_saga(saga_id)
            .from_sequence(SequenceNo::new(2))
            .offset(1)
            .limit(2);

        let results = log.query(query).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].sequence, SequenceNo::new(3));
        assert_eq!(results[1].sequence, SequenceNo::new(4));
    }

    #[tokio::test]
    async fn snapshot_save_and_load_saga() {
        let log = InMemoryDurableLog::new();
        let saga_id = SagaId::new("ORDER-1");

        let records = vec![
            create_record(&saga_id, 1, RecordType::SagaStarted),
            create_record(&saga_id, 2, RecordType::StepStarted),
            create_record(&saga_id, 3, RecordType::StepSucceeded),
        ];
        log.append(records, AppendOptions::new()).await.unwrap();
        log.save_snapshot(Snapshot::new(
            saga_id.clone(),
            "order-processing",
            SequenceNo::new(2),
            serde_json::json!({"state": "saved"}),
        ))
        .await
        .unwrap();

        let (snapshot, tail) = log.load_saga(&saga_id).await.unwrap();
        assert_eq!(snapshot.unwrap().sequence, SequenceNo::new(2));
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].sequence, SequenceNo::new(3));
    }

    #[tokio::test]
    async fn active_sagas_excludes_finished_ones() {
        let log = InMemoryDurableLog::new();
        let done = SagaId::new("ORDER-DONE");
        let running = SagaId::new("ORDER-RUNNING");

        log.append(
            vec![
                create_record(&done, 1, RecordType::SagaStarted),
                create_record(&done, 2, RecordType::SagaFailed),
            ],
            AppendOptions::new(),
        )
        .await
        .unwrap();
        log.append(
            vec![
                create_record(&running, 1, RecordType::SagaStarted),
                create_record(&running, 2, RecordType::StepStarted),
            ],
            AppendOptions::new(),
        )
        .await
        .unwrap();

        assert_eq!(log.active_sagas().await.unwrap(), vec![running]);
        assert!(log.saga_exists(&done).await.unwrap());
        assert!(!log.saga_exists(&SagaId::new("ORDER-NONE")).await.unwrap());
    }

    #[tokio::test]
    async fn stream_all_records() {
        use futures_util::StreamExt;

        let log = InMemoryDurableLog::new();
        log.append(
            vec![create_record(&SagaId::new("ORDER-1"), 1, RecordType::SagaStarted)],
            AppendOptions::new(),
        )
        .await
        .unwrap();
        log.append(
            vec![create_record(&SagaId::new("ORDER-2"), 1, RecordType::SagaStarted)],
            AppendOptions::new(),
        )
        .await
        .unwrap();

        let stream = log.stream_all().await.unwrap();
        let records: Vec<_> = stream.collect().await;
        assert_eq!(records.len(), 2);
    }
}
