//! Executes one step: attempts, timeouts, heartbeats, retries and
//! compensation.

use std::sync::Arc;
use std::time::Duration;

use domain::{
    CompensationOutcome, DomainError, RetryDecision, SagaEvent, StepError, StepSpec, StepStatus,
    TimeoutConfig,
};
use durable_log::DurableLog;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::activities::SagaActivities;
use crate::context::{CancelSignal, StepContext};
use crate::error::{Result, SagaError};
use crate::heartbeat::HeartbeatMonitor;
use crate::journal::SagaJournal;
use crate::task::StepTask;

/// Result of a forward step once the runner gave up or succeeded.
pub type StepOutcome = std::result::Result<serde_json::Value, StepError>;

const HEARTBEAT_BUFFER: usize = 32;

/// Fraction of the heartbeat interval between two staleness checks.
const WATCHDOG_DIVISOR: u32 = 3;

/// Runs the actions of one saga against its journal.
///
/// Infrastructure errors (`SagaError`) abort the saga; step failures are
/// recorded and returned as a [`StepOutcome`].
pub struct StepRunner<L, A> {
    journal: Arc<SagaJournal<L>>,
    activities: Arc<A>,
}

impl<L, A> Clone for StepRunner<L, A> {
    fn clone(&self) -> Self {
        Self {
            journal: Arc::clone(&self.journal),
            activities: Arc::clone(&self.activities),
        }
    }
}

impl<L, A> StepRunner<L, A>
where
    L: DurableLog + 'static,
    A: SagaActivities + 'static,
{
    pub fn new(journal: Arc<SagaJournal<L>>, activities: Arc<A>) -> Self {
        Self {
            journal,
            activities,
        }
    }

    /// Runs the forward action of `spec` until it succeeds or fails
    /// terminally.
    ///
    /// A step left `Running` by a crash is re-driven as its next attempt.
    /// If that attempt would exceed the retry budget, the interrupted
    /// attempt is recorded as a terminal failure instead. A step whose last
    /// attempt failed and awaits a retry waits out that attempt's backoff
    /// before the next one starts.
    #[tracing::instrument(skip(self, spec), fields(saga_id = %self.journal.saga_id(), step = %spec.name))]
    pub async fn run_forward(&self, spec: &StepSpec) -> Result<StepOutcome> {
        let scheduled_at = Instant::now();

        let awaiting_retry = self
            .journal
            .read(|instance| {
                instance
                    .step_named(&spec.name)
                    .filter(|step| step.status == StepStatus::Failed && !step.terminal)
                    .map(|step| step.attempt)
            })
            .await;
        if let Some(failed_attempt) = awaiting_retry {
            let delay = spec.retry.backoff(failed_attempt);
            tracing::info!(
                attempt = failed_attempt,
                delay_ms = delay.as_millis() as u64,
                "retry was pending at restart, backing off"
            );
            tokio::time::sleep(delay).await;
        }

        loop {
            let (status, previous) = self
                .journal
                .read(|instance| {
                    instance
                        .step_named(&spec.name)
                        .map(|step| (step.status, step.attempt))
                })
                .await
                .ok_or_else(|| SagaError::UnknownStep(spec.name.clone()))?;

            if status == StepStatus::Running && spec.retry.is_exhausted(previous + 1) {
                let error = StepError::transient("attempt interrupted by a restart");
                self.journal
                    .record(SagaEvent::step_failed(&spec.name, previous, error.clone(), true))
                    .await?;
                tracing::warn!(
                    attempt = previous,
                    "interrupted attempt exhausted the retry budget"
                );
                return Ok(Err(error));
            }

            let attempt = previous + 1;
            self.journal
                .record(SagaEvent::step_started(&spec.name, attempt))
                .await?;
            metrics::counter!("step_attempts_total", "step" => spec.name.clone()).increment(1);
            tracing::info!(attempt, "step attempt started");

            let outcome = self.attempt(spec, attempt, scheduled_at.elapsed()).await?;

            let error = match outcome {
                Ok(result) => {
                    self.journal
                        .record(SagaEvent::step_succeeded(&spec.name, attempt, result.clone()))
                        .await?;
                    tracing::info!(attempt, "step succeeded");
                    return Ok(Ok(result));
                }
                Err(error) => error,
            };

            // Retry only while the next attempt still fits the schedule-to-close budget
            let retry_after = if error.is_retryable() {
                match spec.retry.next_attempt(attempt) {
                    RetryDecision::RetryAfter(delay)
                        if scheduled_at.elapsed() + delay < spec.timeouts.schedule_to_close =>
                    {
                        Some(delay)
                    }
                    _ => None,
                }
            } else {
                None
            };

            self.journal
                .record(SagaEvent::step_failed(
                    &spec.name,
                    attempt,
                    error.clone(),
                    retry_after.is_none(),
                ))
                .await?;

            let Some(delay) = retry_after else {
                tracing::warn!(attempt, %error, "step failed terminally");
                return Ok(Err(error));
            };

            metrics::counter!("step_retries_total", "step" => spec.name.clone()).increment(1);
            tracing::warn!(
                attempt,
                %error,
                delay_ms = delay.as_millis() as u64,
                "step failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Launches [`run_forward`](Self::run_forward) on its own task.
    pub fn spawn_forward(&self, spec: StepSpec) -> StepTask<StepOutcome> {
        let runner = self.clone();
        StepTask::spawn(spec.name.clone(), async move { runner.run_forward(&spec).await })
    }

    /// Runs one attempt, bounded by its timeout and, for heartbeating steps,
    /// by the heartbeat watchdog.
    async fn attempt(
        &self,
        spec: &StepSpec,
        attempt: u32,
        elapsed: Duration,
    ) -> Result<StepOutcome> {
        let limit = spec.timeouts.attempt_timeout(elapsed);
        let (cancel, signal) = CancelSignal::pair();
        let results = self.journal.read(|instance| instance.results()).await;
        let ctx = StepContext::new(
            self.journal.saga_id().clone(),
            &spec.name,
            attempt,
            spec.retry.max_attempts,
            signal,
        )
        .with_results(results);

        let Some(interval) = spec.timeouts.heartbeat_interval else {
            let action = self.activities.execute(&spec.name, ctx);
            let outcome = match tokio::time::timeout(limit, action).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StepError::timed_out(limit)),
            };
            return Ok(outcome);
        };

        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(HEARTBEAT_BUFFER);
        let ctx = ctx.with_heartbeat(heartbeat_tx);

        let mut monitor = HeartbeatMonitor::new();
        monitor.register(&spec.name, interval, spec.timeouts.start_to_close, Instant::now());

        let tick = (interval / WATCHDOG_DIVISOR).max(Duration::from_millis(1));
        let mut watchdog = tokio::time::interval_at(Instant::now() + tick, tick);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let deadline = tokio::time::sleep(limit);
        let action = self.activities.execute(&spec.name, ctx);
        tokio::pin!(deadline, action);

        let outcome = loop {
            tokio::select! {
                outcome = &mut action => break outcome,
                Some(beat) = heartbeat_rx.recv() => {
                    monitor.record_heartbeat_at(&spec.name, beat.details.clone(), beat.at);
                    self.persist_heartbeat(spec, attempt, beat.details).await?;
                }
                _ = watchdog.tick() => {
                    if monitor.is_stale(&spec.name, Instant::now()) {
                        metrics::counter!("step_heartbeat_stale_total", "step" => spec.name.clone())
                            .increment(1);
                        tracing::warn!(
                            attempt,
                            interval_ms = interval.as_millis() as u64,
                            "heartbeat stale, cancelling attempt"
                        );
                        break Err(StepError::stale_heartbeat(interval));
                    }
                }
                _ = &mut deadline => break Err(StepError::timed_out(limit)),
            }
        };

        // Heartbeats sent in the same poll that finished the action
        while let Ok(beat) = heartbeat_rx.try_recv() {
            self.persist_heartbeat(spec, attempt, beat.details).await?;
        }

        // Tell a still-running action to stop; its late result is dropped
        cancel.cancel();
        monitor.deregister(&spec.name);
        Ok(outcome)
    }

    async fn persist_heartbeat(
        &self,
        spec: &StepSpec,
        attempt: u32,
        details: Option<serde_json::Value>,
    ) -> Result<()> {
        match self
            .journal
            .record(SagaEvent::step_heartbeat(&spec.name, attempt, details))
            .await
        {
            Ok(()) => Ok(()),
            Err(SagaError::Domain(DomainError::InvalidTransition { reason, .. })) => {
                tracing::debug!(attempt, %reason, "late heartbeat discarded");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Runs the compensating action of the step at `index` once.
    ///
    /// A failing compensation is logged and returned as its outcome; it
    /// never aborts the rollback.
    #[tracing::instrument(skip(self, timeouts), fields(saga_id = %self.journal.saga_id()))]
    pub async fn compensate(
        &self,
        index: usize,
        timeouts: &TimeoutConfig,
    ) -> Result<CompensationOutcome> {
        let (name, status) = self
            .journal
            .read(|instance| instance.step(index).map(|s| (s.name.clone(), s.status)))
            .await
            .ok_or_else(|| SagaError::UnknownStep(format!("#{index}")))?;

        if status == StepStatus::Compensating {
            tracing::info!(step = %name, "re-running interrupted compensation");
        } else {
            self.journal
                .record(SagaEvent::compensation_started(&name))
                .await?;
        }

        let limit = timeouts.attempt_timeout(Duration::ZERO);
        let results = self.journal.read(|instance| instance.results()).await;
        let ctx = StepContext::new(
            self.journal.saga_id().clone(),
            &name,
            1,
            1,
            CancelSignal::never(),
        )
        .with_results(results);

        let action = self.activities.compensate(&name, ctx);
        let outcome = match tokio::time::timeout(limit, action).await {
            Ok(Ok(())) => CompensationOutcome::Compensated,
            Ok(Err(error)) => CompensationOutcome::Failed(StepError::compensation(&error)),
            Err(_) => {
                CompensationOutcome::Failed(StepError::compensation(&StepError::timed_out(limit)))
            }
        };

        match &outcome {
            CompensationOutcome::Compensated => tracing::info!(step = %name, "step compensated"),
            CompensationOutcome::Failed(error) => {
                metrics::counter!("compensation_failed_total", "step" => name.clone()).increment(1);
                tracing::error!(step = %name, %error, "compensation failed, continuing rollback");
            }
        }

        self.journal
            .record(SagaEvent::compensation_finished(&name, outcome.clone()))
            .await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use common::SagaId;
    use domain::{RetryPolicy, SagaDefinition, StepErrorKind};
    use durable_log::{InMemoryDurableLog, RecordType};
    use serde_json::json;

    #[derive(Debug, Clone, Copy)]
    enum Script {
        /// Fails the first `n` calls with a transient error.
        FailTransient(u32),
        Hang,
        /// Heartbeats once, then never returns.
        HeartbeatOnce,
        /// Heartbeats every five seconds `n` times, then succeeds.
        Heartbeats(u32),
        FailCompensation,
    }

    struct ScriptedActivities {
        script: Script,
        calls: AtomicU32,
    }

    impl ScriptedActivities {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SagaActivities for ScriptedActivities {
        async fn execute(&self, _step: &str, ctx: StepContext) -> StepOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.script {
                Script::FailTransient(n) if call <= n => Err(StepError::transient("flaky")),
                Script::Hang => std::future::pending().await,
                Script::HeartbeatOnce => {
                    let _ = ctx.heartbeat(None).await;
                    std::future::pending().await
                }
                Script::Heartbeats(n) => {
                    for i in 0..n {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        ctx.heartbeat(Some(json!(i)))
                            .await
                            .map_err(|e| StepError::transient(e.to_string()))?;
                    }
                    Ok(json!({ "done": true }))
                }
                _ => Ok(json!({ "call": call })),
            }
        }

        async fn compensate(
            &self,
            _step: &str,
            _ctx: StepContext,
        ) -> std::result::Result<(), StepError> {
            match self.script {
                Script::FailCompensation => Err(StepError::permanent("warehouse offline")),
                _ => Ok(()),
            }
        }

        async fn notify_failure(
            &self,
            _saga_id: &SagaId,
            _reason: &str,
        ) -> std::result::Result<(), StepError> {
            Ok(())
        }
    }

    async fn runner_for(
        specs: &[&StepSpec],
        activities: Arc<ScriptedActivities>,
    ) -> (StepRunner<InMemoryDurableLog, ScriptedActivities>, InMemoryDurableLog) {
        let log = InMemoryDurableLog::new();
        let saga_id = SagaId::new("ORDER-1");
        let definition = specs
            .iter()
            .fold(SagaDefinition::new("test"), |d, spec| d.step((*spec).clone()));

        let journal = SagaJournal::new(log.clone(), saga_id.clone(), "test");
        journal
            .record(SagaEvent::saga_started(saga_id, "test", definition.planned_steps()))
            .await
            .unwrap();

        (StepRunner::new(Arc::new(journal), activities), log)
    }

    async fn count(log: &InMemoryDurableLog, record_type: RecordType) -> usize {
        log.read(&SagaId::new("ORDER-1"))
            .await
            .unwrap()
            .iter()
            .filter(|r| r.record_type == record_type)
            .count()
    }

    fn shipping_spec() -> StepSpec {
        StepSpec::new("ship")
            .with_timeouts(TimeoutConfig::shipping())
            .with_retry(RetryPolicy::no_retry())
            .in_background()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let spec = StepSpec::new("pay");
        let activities = ScriptedActivities::new(Script::FailTransient(2));
        let (runner, log) = runner_for(&[&spec], Arc::clone(&activities)).await;

        let started = Instant::now();
        let outcome = runner.run_forward(&spec).await.unwrap();

        assert_eq!(outcome.unwrap(), json!({ "call": 3 }));
        assert_eq!(activities.calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2 + 4));
        assert_eq!(count(&log, RecordType::StepFailed).await, 2);
        assert_eq!(count(&log, RecordType::StepSucceeded).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_to_close_bounds_retries() {
        let spec = StepSpec::new("pay");
        let activities = ScriptedActivities::new(Script::Hang);
        let (runner, _log) = runner_for(&[&spec], Arc::clone(&activities)).await;

        let started = Instant::now();
        let error = runner.run_forward(&spec).await.unwrap().unwrap_err();

        // 20 s + 2 s + 20 s + 4 s + the 14 s left of the minute
        assert_eq!(error.kind, StepErrorKind::TransientCollaboratorError);
        assert_eq!(activities.calls(), 3);
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(started.elapsed() < Duration::from_secs(61));

        let step = runner
            .journal
            .read(|instance| instance.step(0).cloned())
            .await
            .unwrap();
        assert!(step.is_terminally_failed());
        assert_eq!(step.attempt, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_heartbeat_cancels_attempt() {
        let spec = shipping_spec();
        let activities = ScriptedActivities::new(Script::HeartbeatOnce);
        let (runner, log) = runner_for(&[&spec], Arc::clone(&activities)).await;

        let started = Instant::now();
        let error = runner.run_forward(&spec).await.unwrap().unwrap_err();

        assert_eq!(error.kind, StepErrorKind::StaleHeartbeat);
        assert!(started.elapsed() > Duration::from_secs(15));
        assert!(started.elapsed() <= Duration::from_secs(20));
        assert_eq!(count(&log, RecordType::StepHeartbeat).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_are_persisted() {
        let spec = shipping_spec();
        let activities = ScriptedActivities::new(Script::Heartbeats(4));
        let (runner, log) = runner_for(&[&spec], activities).await;

        let outcome = runner.run_forward(&spec).await.unwrap();

        assert!(outcome.is_ok());
        assert_eq!(count(&log, RecordType::StepHeartbeat).await, 4);
        let details = runner
            .journal
            .read(|instance| instance.step(0).and_then(|s| s.last_heartbeat_details.clone()))
            .await;
        assert_eq!(details, Some(json!(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_step_joins_with_outcome() {
        let spec = shipping_spec();
        let activities = ScriptedActivities::new(Script::Heartbeats(2));
        let (runner, _log) = runner_for(&[&spec], activities).await;

        let task = runner.spawn_forward(spec);
        assert_eq!(task.step(), "ship");

        let outcome = task.join().await.unwrap();
        assert_eq!(outcome.unwrap(), json!({ "done": true }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_last_attempt_fails_terminally() {
        let spec = StepSpec::new("pay").with_retry(RetryPolicy::transient().with_max_attempts(2));
        let activities = ScriptedActivities::new(Script::FailTransient(0));
        let (runner, log) = runner_for(&[&spec], Arc::clone(&activities)).await;

        // A previous process crashed during the second attempt
        runner.journal.record(SagaEvent::step_started("pay", 1)).await.unwrap();
        runner
            .journal
            .record(SagaEvent::step_failed("pay", 1, StepError::transient("flaky"), false))
            .await
            .unwrap();
        runner.journal.record(SagaEvent::step_started("pay", 2)).await.unwrap();

        let error = runner.run_forward(&spec).await.unwrap().unwrap_err();

        assert_eq!(error.message, "attempt interrupted by a restart");
        assert_eq!(activities.calls(), 0);
        assert_eq!(count(&log, RecordType::StepStarted).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_retry_backs_off_after_restart() {
        let spec = StepSpec::new("pay");
        let activities = ScriptedActivities::new(Script::FailTransient(0));
        let (runner, log) = runner_for(&[&spec], Arc::clone(&activities)).await;

        // A previous process crashed while waiting to retry the first attempt
        runner.journal.record(SagaEvent::step_started("pay", 1)).await.unwrap();
        runner
            .journal
            .record(SagaEvent::step_failed("pay", 1, StepError::transient("flaky"), false))
            .await
            .unwrap();

        let started = Instant::now();
        let result = runner.run_forward(&spec).await.unwrap();

        assert!(result.is_ok());
        assert_eq!(started.elapsed(), spec.retry.backoff(1));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(activities.calls(), 1);
        assert_eq!(count(&log, RecordType::StepStarted).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_compensation_is_recorded() {
        let reserve = StepSpec::new("reserve").with_compensation("release");
        let ship = StepSpec::new("ship").with_retry(RetryPolicy::no_retry());
        let activities = ScriptedActivities::new(Script::FailCompensation);
        let (runner, _log) = runner_for(&[&reserve, &ship], activities).await;

        runner.run_forward(&reserve).await.unwrap().unwrap();
        let cause = StepError::permanent("carrier refused");
        for event in [
            SagaEvent::step_started("ship", 1),
            SagaEvent::step_failed("ship", 1, cause.clone(), true),
            SagaEvent::saga_compensating("ship", cause),
        ] {
            runner.journal.record(event).await.unwrap();
        }

        let outcome = runner.compensate(0, &TimeoutConfig::compensation()).await.unwrap();

        match outcome {
            CompensationOutcome::Failed(error) => {
                assert_eq!(error.kind, StepErrorKind::CompensationError);
                assert!(error.message.contains("warehouse offline"));
            }
            other => panic!("Expected failed compensation, got {other:?}"),
        }
        let status = runner
            .journal
            .read(|instance| instance.step(0).map(|s| s.status))
            .await;
        assert_eq!(status, Some(StepStatus::CompensationFailed));
    }
}
