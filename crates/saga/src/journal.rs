//! Persist-then-apply writer of one saga.

use common::SagaId;
use domain::{Aggregate, DomainEvent, SagaEvent, SagaInstance, SagaOutcome};
use durable_log::{AppendOptions, DurableLog, DurableLogExt, LogRecord};
use tokio::sync::Mutex;

use crate::error::Result;

/// The in-memory instance of one saga together with its log.
///
/// Every transition is checked against the instance, appended to the log
/// with a compare-and-swap on the instance's sequence number, and only then
/// applied. The mutex serializes the orchestrator and a background step of
/// the same saga.
#[derive(Debug)]
pub struct SagaJournal<L> {
    log: L,
    saga_id: SagaId,
    saga_type: String,
    instance: Mutex<SagaInstance>,
}

impl<L: DurableLog> SagaJournal<L> {
    /// Creates a journal for a saga with no records yet.
    pub fn new(log: L, saga_id: SagaId, saga_type: impl Into<String>) -> Self {
        Self {
            log,
            saga_id,
            saga_type: saga_type.into(),
            instance: Mutex::new(SagaInstance::default()),
        }
    }

    /// Rebuilds the journal of an existing saga from the log.
    ///
    /// Returns None if the saga has no records.
    pub async fn open(log: L, saga_id: &SagaId) -> Result<Option<Self>> {
        let (snapshot, records) = log.load_saga(saga_id).await?;
        let Some(instance) = SagaInstance::restore(snapshot, records)? else {
            return Ok(None);
        };

        Ok(Some(Self {
            log,
            saga_id: saga_id.clone(),
            saga_type: instance.saga_type().to_string(),
            instance: Mutex::new(instance),
        }))
    }

    pub fn saga_id(&self) -> &SagaId {
        &self.saga_id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    /// Persists `event` and applies it.
    ///
    /// Fails without touching the instance if the transition is illegal or
    /// another writer appended first.
    pub async fn record(&self, event: SagaEvent) -> Result<()> {
        let mut instance = self.instance.lock().await;
        instance.check(&event)?;

        let current = instance.sequence();
        let record = LogRecord::builder()
            .saga_id(self.saga_id.clone())
            .saga_type(self.saga_type.clone())
            .sequence(current.next())
            .record_type(event.record_type())
            .step_name(event.step_name().map(str::to_string))
            .payload(&event)?
            .build()?;

        let sequence = self
            .log
            .append_record(record.clone(), AppendOptions::expect_sequence(current))
            .await?;

        tracing::debug!(
            saga_id = %self.saga_id,
            record_type = %record.record_type,
            sequence = %sequence,
            "transition persisted"
        );

        instance.apply(event);
        instance.set_sequence(sequence);
        instance.record_applied(&record);
        Ok(())
    }

    /// Runs `f` against the current instance.
    pub async fn read<R>(&self, f: impl FnOnce(&SagaInstance) -> R) -> R {
        let instance = self.instance.lock().await;
        f(&instance)
    }

    /// Returns a copy of the current instance.
    pub async fn instance(&self) -> SagaInstance {
        self.instance.lock().await.clone()
    }

    /// Returns the recorded outcome once the saga is terminal.
    pub async fn outcome(&self) -> Option<SagaOutcome> {
        self.read(SagaInstance::outcome).await
    }

    /// Writes a snapshot of the terminal instance to the archive.
    pub async fn archive(&self) -> Result<()> {
        let snapshot = self.read(SagaInstance::to_snapshot).await?;
        self.log.save_snapshot(snapshot).await?;
        tracing::debug!(saga_id = %self.saga_id, "saga archived");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{DomainError, PlannedStep, SagaStatus};
    use durable_log::{DurableLogError, InMemoryDurableLog, RecordType, SequenceNo};

    use crate::error::SagaError;

    fn started() -> SagaEvent {
        SagaEvent::saga_started(
            SagaId::new("ORDER-1"),
            "order-processing",
            vec![PlannedStep {
                name: "processPayment".into(),
                compensation: Some("refundPayment".into()),
            }],
        )
    }

    #[tokio::test]
    async fn test_record_persists_then_applies() {
        let log = InMemoryDurableLog::new();
        let journal = SagaJournal::new(log.clone(), SagaId::new("ORDER-1"), "order-processing");

        journal.record(started()).await.unwrap();
        journal
            .record(SagaEvent::step_started("processPayment", 1))
            .await
            .unwrap();

        let records = log.read(&SagaId::new("ORDER-1")).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].record_type, RecordType::StepStarted);
        assert_eq!(records[1].step_name.as_deref(), Some("processPayment"));

        let instance = journal.instance().await;
        assert_eq!(instance.sequence(), SequenceNo::new(2));
        assert_eq!(instance.status(), SagaStatus::Running);
    }

    #[tokio::test]
    async fn test_illegal_transition_is_not_persisted() {
        let log = InMemoryDurableLog::new();
        let journal = SagaJournal::new(log.clone(), SagaId::new("ORDER-1"), "order-processing");
        journal.record(started()).await.unwrap();

        let result = journal.record(SagaEvent::saga_completed(None)).await;
        assert!(matches!(
            result,
            Err(SagaError::Domain(DomainError::InvalidTransition { .. }))
        ));
        assert_eq!(log.record_count().await, 1);
    }

    #[tokio::test]
    async fn test_second_writer_loses() {
        let log = InMemoryDurableLog::new();
        let first = SagaJournal::new(log.clone(), SagaId::new("ORDER-1"), "order-processing");
        first.record(started()).await.unwrap();

        let second = SagaJournal::open(log.clone(), &SagaId::new("ORDER-1"))
            .await
            .unwrap()
            .unwrap();
        first
            .record(SagaEvent::step_started("processPayment", 1))
            .await
            .unwrap();

        let err = second
            .record(SagaEvent::step_started("processPayment", 1))
            .await
            .unwrap_err();
        assert!(err.is_concurrency_conflict());
        assert!(matches!(
            err,
            SagaError::Log(DurableLogError::ConcurrencyConflict { .. })
        ));
        assert_eq!(second.instance().await.sequence(), SequenceNo::new(1));
    }

    #[tokio::test]
    async fn test_open_unknown_saga() {
        let log = InMemoryDurableLog::new();
        let journal = SagaJournal::open(log, &SagaId::new("missing")).await.unwrap();
        assert!(journal.is_none());
    }
}
