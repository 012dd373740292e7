//! Drives saga instances from start (or a crash) to a terminal status.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use common::SagaId;
use domain::{
    ExecutionMode, NextAction, SagaDefinition, SagaEvent, SagaInstance, SagaOutcome, StepError,
};
use durable_log::{DurableLog, DurableLogExt, LogQuery, LogRecord, RecordType};
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::activities::SagaActivities;
use crate::error::{Result, SagaError};
use crate::journal::SagaJournal;
use crate::runner::StepRunner;

type Leases = Arc<Mutex<HashSet<SagaId>>>;

/// Marks a saga as driven by this process until dropped.
struct Lease {
    saga_id: SagaId,
    leases: Leases,
}

impl Lease {
    fn acquire(leases: &Leases, saga_id: &SagaId) -> Result<Self> {
        let mut held = leases.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(saga_id.clone()) {
            return Err(SagaError::AlreadyRunning(saga_id.clone()));
        }
        Ok(Self {
            saga_id: saga_id.clone(),
            leases: Arc::clone(leases),
        })
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.saga_id);
    }
}

/// Handle to a saga driven on its own task.
#[derive(Debug)]
pub struct SagaHandle {
    saga_id: SagaId,
    task: JoinHandle<Result<SagaOutcome>>,
}

impl SagaHandle {
    pub fn saga_id(&self) -> &SagaId {
        &self.saga_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the saga's outcome.
    pub async fn join(self) -> Result<SagaOutcome> {
        self.task.await.map_err(|e| SagaError::TaskAborted {
            task: self.saga_id.to_string(),
            reason: e.to_string(),
        })?
    }
}

/// Orchestrates sagas of one definition.
///
/// The orchestrator keeps no saga state of its own: each run rebuilds the
/// instance from the durable log and asks it for the next action, so a
/// fresh start and a recovery after a crash take the same path.
pub struct SagaOrchestrator<L, A> {
    log: L,
    activities: Arc<A>,
    definition: Arc<SagaDefinition>,
    leases: Leases,
}

impl<L: Clone, A> Clone for SagaOrchestrator<L, A> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            activities: Arc::clone(&self.activities),
            definition: Arc::clone(&self.definition),
            leases: Arc::clone(&self.leases),
        }
    }
}

impl<L, A> SagaOrchestrator<L, A>
where
    L: DurableLog + Clone + 'static,
    A: SagaActivities + 'static,
{
    /// Creates an orchestrator. Fails if the definition is invalid.
    pub fn new(log: L, activities: A, definition: SagaDefinition) -> Result<Self> {
        definition.validate()?;
        Ok(Self {
            log,
            activities: Arc::new(activities),
            definition: Arc::new(definition),
            leases: Arc::default(),
        })
    }

    pub fn definition(&self) -> &SagaDefinition {
        &self.definition
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    /// Returns true if this process is currently driving the saga.
    pub fn is_running(&self, saga_id: &SagaId) -> bool {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(saga_id)
    }

    /// Runs the saga of an order to its outcome.
    ///
    /// A saga that already finished returns its recorded outcome; an
    /// interrupted one is resumed. The saga is driven on its own task, so
    /// dropping the returned future stops the wait but not the saga.
    #[tracing::instrument(skip_all, fields(saga_id = %saga_id))]
    pub async fn start(&self, saga_id: SagaId) -> Result<SagaOutcome> {
        self.spawn(saga_id)?.join().await
    }

    /// Runs the saga of an order on its own task.
    ///
    /// Fails immediately with `AlreadyRunning` if the saga is being driven.
    pub fn spawn(&self, saga_id: SagaId) -> Result<SagaHandle> {
        let lease = self.lease(&saga_id)?;
        let orchestrator = self.clone();
        let task_id = saga_id.clone();
        Ok(Self::detach(saga_id, async move {
            orchestrator.start_leased(task_id, lease).await
        }))
    }

    /// Resumes an existing saga from its log.
    ///
    /// Like `start`, the saga keeps running if the caller stops waiting.
    #[tracing::instrument(skip_all, fields(saga_id = %saga_id))]
    pub async fn resume(&self, saga_id: SagaId) -> Result<SagaOutcome> {
        let lease = self.lease(&saga_id)?;
        let orchestrator = self.clone();
        let task_id = saga_id.clone();
        Self::detach(saga_id, async move {
            orchestrator.resume_leased(task_id, lease).await
        })
        .join()
        .await
    }

    /// Resumes every saga whose log does not end in a terminal record.
    ///
    /// Sagas are driven concurrently; each result is reported separately.
    #[tracing::instrument(skip(self))]
    pub async fn recover_all(&self) -> Result<Vec<(SagaId, Result<SagaOutcome>)>> {
        let active = self.log.active_sagas().await?;
        tracing::info!(count = active.len(), "recovering active sagas");

        let resumed = active.into_iter().map(|saga_id| async move {
            let result = self.resume(saga_id.clone()).await;
            if let Err(e) = &result {
                tracing::error!(saga_id = %saga_id, error = %e, "saga recovery failed");
            }
            (saga_id, result)
        });
        Ok(join_all(resumed).await)
    }

    /// Loads a saga instance from the log.
    pub async fn get_saga(&self, saga_id: &SagaId) -> Result<Option<SagaInstance>> {
        let (snapshot, records) = self.log.load_saga(saga_id).await?;
        Ok(SagaInstance::restore(snapshot, records)?)
    }

    /// Returns every log record of a saga.
    pub async fn records(&self, saga_id: &SagaId) -> Result<Vec<LogRecord>> {
        Ok(self.log.read(saga_id).await?)
    }

    /// Returns the records of a saga that match `query`, in sequence order.
    pub async fn query_records(
        &self,
        saga_id: &SagaId,
        query: LogQuery,
    ) -> Result<Vec<LogRecord>> {
        let mut records = self.log.query(query.saga_id(saga_id.clone())).await?;
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    /// Returns the records of one type across all sagas, oldest first.
    pub async fn records_of_type(&self, record_type: RecordType) -> Result<Vec<LogRecord>> {
        Ok(self.log.records_by_type(record_type).await?)
    }

    pub async fn saga_exists(&self, saga_id: &SagaId) -> Result<bool> {
        Ok(self.log.saga_exists(saga_id).await?)
    }

    fn lease(&self, saga_id: &SagaId) -> Result<Lease> {
        if saga_id.is_blank() {
            return Err(SagaError::InvalidOrderId(saga_id.to_string()));
        }
        Lease::acquire(&self.leases, saga_id)
    }

    /// Drives a leased saga on a task of its own.
    ///
    /// The lease moves into the task and is released when the saga stops.
    fn detach<F>(saga_id: SagaId, driver: F) -> SagaHandle
    where
        F: Future<Output = Result<SagaOutcome>> + Send + 'static,
    {
        let task = tokio::spawn(driver.in_current_span());
        SagaHandle { saga_id, task }
    }

    async fn resume_leased(&self, saga_id: SagaId, _lease: Lease) -> Result<SagaOutcome> {
        let journal = SagaJournal::open(self.log.clone(), &saga_id)
            .await?
            .ok_or_else(|| SagaError::NotFound(saga_id.clone()))?;
        tracing::info!(saga_id = %saga_id, "resuming saga");
        self.drive(Arc::new(journal)).await
    }

    async fn start_leased(&self, saga_id: SagaId, _lease: Lease) -> Result<SagaOutcome> {
        let journal = match SagaJournal::open(self.log.clone(), &saga_id).await? {
            Some(journal) => {
                if let Some(outcome) = journal.outcome().await {
                    tracing::info!(saga_id = %saga_id, "saga already finished");
                    return Ok(outcome);
                }
                tracing::info!(saga_id = %saga_id, "saga already started, resuming");
                journal
            }
            None => SagaJournal::new(self.log.clone(), saga_id, self.definition.saga_type()),
        };
        self.drive(Arc::new(journal)).await
    }

    /// Executes next actions until the saga is terminal.
    async fn drive(&self, journal: Arc<SagaJournal<L>>) -> Result<SagaOutcome> {
        let started_at = Instant::now();
        let saga_id = journal.saga_id().clone();
        let runner = StepRunner::new(Arc::clone(&journal), Arc::clone(&self.activities));

        loop {
            let action = journal.read(SagaInstance::next_action).await;
            tracing::debug!(saga_id = %saga_id, ?action, "next action");

            match action {
                NextAction::Start => {
                    journal
                        .record(SagaEvent::saga_started(
                            saga_id.clone(),
                            self.definition.saga_type(),
                            self.definition.planned_steps(),
                        ))
                        .await?;
                    metrics::counter!("saga_started_total").increment(1);
                    tracing::info!(saga_id = %saga_id, "saga started");
                }
                NextAction::RunStep(index) => {
                    let name = self.step_name(&journal, index).await?;
                    let spec = self
                        .definition
                        .find(&name)
                        .ok_or_else(|| SagaError::UnknownStep(name.clone()))?;

                    let outcome = match spec.mode {
                        ExecutionMode::Inline => runner.run_forward(spec).await?,
                        ExecutionMode::Background => {
                            let task = runner.spawn_forward(spec.clone());
                            tracing::info!(
                                saga_id = %saga_id,
                                step = %name,
                                "step launched in background"
                            );
                            task.join().await?
                        }
                    };
                    if let Err(error) = outcome {
                        tracing::warn!(
                            saga_id = %saga_id,
                            step = %name,
                            %error,
                            "step failed, compensating"
                        );
                    }
                }
                NextAction::BeginCompensation(index) => {
                    let (name, error) = journal
                        .read(|instance| {
                            instance
                                .step(index)
                                .map(|s| (s.name.clone(), s.last_error.clone()))
                        })
                        .await
                        .ok_or_else(|| SagaError::UnknownStep(format!("#{index}")))?;
                    let error = error.unwrap_or_else(|| StepError::permanent("unknown failure"));
                    journal
                        .record(SagaEvent::saga_compensating(name, error))
                        .await?;
                }
                NextAction::Compensate(index) => {
                    runner
                        .compensate(index, self.definition.compensation_timeouts())
                        .await?;
                }
                NextAction::NotifyFailure => {
                    let reason = journal
                        .read(|instance| instance.failure().map(|f| f.error.to_string()))
                        .await
                        .unwrap_or_default();
                    let result = self.notify_failure(&saga_id, &reason).await;
                    if let Err(error) = &result {
                        tracing::error!(
                            saga_id = %saga_id,
                            %error,
                            "failure notification not delivered"
                        );
                    }
                    journal.record(SagaEvent::failure_notified(result)).await?;
                }
                NextAction::Complete => {
                    let tracking_id = journal
                        .read(|instance| self.activities.tracking_id(instance))
                        .await;
                    journal
                        .record(SagaEvent::saga_completed(tracking_id.clone()))
                        .await?;

                    let duration = started_at.elapsed().as_secs_f64();
                    metrics::counter!("saga_completed_total").increment(1);
                    metrics::histogram!("saga_duration_seconds").record(duration);
                    tracing::info!(saga_id = %saga_id, ?tracking_id, duration, "saga completed");
                }
                NextAction::Fail => {
                    let (failed_step, reason) = journal
                        .read(|instance| {
                            instance
                                .failure()
                                .map(|f| (f.failed_step.clone(), f.error.to_string()))
                        })
                        .await
                        .unwrap_or_default();
                    journal
                        .record(SagaEvent::saga_failed(&failed_step, &reason))
                        .await?;

                    let duration = started_at.elapsed().as_secs_f64();
                    metrics::counter!("saga_failed_total").increment(1);
                    metrics::histogram!("saga_duration_seconds").record(duration);
                    tracing::warn!(
                        saga_id = %saga_id,
                        %failed_step,
                        %reason,
                        duration,
                        "saga failed"
                    );
                }
                NextAction::Finished => {
                    journal.archive().await?;
                    return journal
                        .outcome()
                        .await
                        .ok_or(SagaError::MissingOutcome(saga_id));
                }
            }
        }
    }

    async fn step_name(&self, journal: &SagaJournal<L>, index: usize) -> Result<String> {
        journal
            .read(|instance| instance.step(index).map(|s| s.name.clone()))
            .await
            .ok_or_else(|| SagaError::UnknownStep(format!("#{index}")))
    }

    /// Sends the failure notification once, under the compensation timeout.
    async fn notify_failure(
        &self,
        saga_id: &SagaId,
        reason: &str,
    ) -> std::result::Result<(), StepError> {
        let limit = self
            .definition
            .compensation_timeouts()
            .attempt_timeout(Duration::ZERO);
        let notification = self.activities.notify_failure(saga_id, reason);
        match tokio::time::timeout(limit, notification).await {
            Ok(result) => result,
            Err(_) => Err(StepError::timed_out(limit)),
        }
    }
}
