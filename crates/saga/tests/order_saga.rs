//! Integration tests for the order-processing saga.
//!
//! All tests run on tokio's paused clock, so heartbeat intervals and
//! backoffs elapse instantly while keeping their order.

use std::time::Duration;

use common::SagaId;
use domain::{
    Aggregate, CompensationOutcome, SagaOutcome, SagaStatus, StepErrorKind, StepStatus,
};
use durable_log::{DurableLog, InMemoryDurableLog, LogRecord, RecordType};
use saga::order_processing::{
    self, CHECK_INVENTORY, NOTIFY_CUSTOMER, PROCESS_PAYMENT, SHIP_ORDER,
};
use saga::{
    InMemoryInventoryService, InMemoryNotificationService, InMemoryOrderActivities,
    InMemoryPaymentService, InMemoryShippingService, OrderActivities, SagaError,
    SagaOrchestrator, ShippingBehaviour,
};
use tokio::time::Instant;

type TestOrchestrator = SagaOrchestrator<InMemoryDurableLog, InMemoryOrderActivities>;

struct TestHarness {
    log: InMemoryDurableLog,
    orchestrator: TestOrchestrator,
    payment: InMemoryPaymentService,
    inventory: InMemoryInventoryService,
    shipping: InMemoryShippingService,
    notification: InMemoryNotificationService,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_log(InMemoryDurableLog::new())
    }

    /// A fresh process over an existing log.
    fn with_log(log: InMemoryDurableLog) -> Self {
        let payment = InMemoryPaymentService::new();
        let inventory = InMemoryInventoryService::new();
        let shipping = InMemoryShippingService::new();
        let notification = InMemoryNotificationService::new();

        let activities = OrderActivities::new(
            payment.clone(),
            inventory.clone(),
            shipping.clone(),
            notification.clone(),
        );
        let orchestrator =
            SagaOrchestrator::new(log.clone(), activities, order_processing::definition())
                .unwrap();

        Self {
            log,
            orchestrator,
            payment,
            inventory,
            shipping,
            notification,
        }
    }

    async fn records(&self, order_id: &str) -> Vec<LogRecord> {
        self.log.read(&SagaId::new(order_id)).await.unwrap()
    }

    async fn count(&self, order_id: &str, record_type: RecordType) -> usize {
        self.records(order_id)
            .await
            .iter()
            .filter(|r| r.record_type == record_type)
            .count()
    }
}

fn order(id: &str) -> SagaId {
    SagaId::new(id)
}

fn compensated_steps(outcome: &SagaOutcome) -> Vec<(String, bool)> {
    outcome
        .failure()
        .unwrap()
        .compensations
        .iter()
        .map(|c| (c.step.clone(), c.outcome.is_compensated()))
        .collect()
}

mod scenarios {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn all_steps_succeed() {
        let h = TestHarness::new();

        let outcome = h.orchestrator.start(order("ORDER-1")).await.unwrap();

        assert_eq!(
            outcome,
            SagaOutcome::Completed {
                tracking_id: Some("TRACK-ORDER-1".into())
            }
        );
        assert!(h.payment.is_charged("ORDER-1"));
        assert!(h.inventory.is_reserved("ORDER-1"));
        assert_eq!(h.shipping.tracking_id("ORDER-1").as_deref(), Some("TRACK-ORDER-1"));
        assert_eq!(
            h.notification.notified_tracking_id("ORDER-1").as_deref(),
            Some("TRACK-ORDER-1")
        );
        assert_eq!(h.notification.failure_notice_count(), 0);

        // Shipping heartbeat ten times, each persisted
        assert_eq!(h.count("ORDER-1", RecordType::StepHeartbeat).await, 10);
        assert_eq!(h.count("ORDER-1", RecordType::CompensationStarted).await, 0);

        let saga = h.orchestrator.get_saga(&order("ORDER-1")).await.unwrap().unwrap();
        assert_eq!(saga.status(), SagaStatus::Completed);
        assert!(saga.steps().iter().all(|s| s.status == StepStatus::Succeeded));
        assert_eq!(
            saga.step_named(SHIP_ORDER).unwrap().last_heartbeat_details,
            Some(serde_json::json!("shipping-step-9"))
        );

        // Archived and no longer active
        assert!(h.log.get_snapshot(&order("ORDER-1")).await.unwrap().is_some());
        assert!(h.log.active_sagas().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn inventory_unavailable_refunds_payment_only() {
        let h = TestHarness::new();
        h.inventory.set_available(false);

        let outcome = h.orchestrator.start(order("ORDER-2")).await.unwrap();

        let failure = outcome.failure().unwrap();
        assert_eq!(failure.failed_step, CHECK_INVENTORY);
        assert_eq!(failure.cause.kind, StepErrorKind::BusinessRuleFailure);
        assert!(failure.customer_notified);
        assert_eq!(
            compensated_steps(&outcome),
            vec![(PROCESS_PAYMENT.to_string(), true)]
        );

        // Business rule failures are not retried
        assert_eq!(h.inventory.check_calls(), 1);
        assert!(h.payment.is_refunded("ORDER-2"));
        assert_eq!(h.inventory.restock_calls(), 0);
        assert_eq!(h.shipping.ship_calls(), 0);
        assert_eq!(h.notification.notify_calls(), 0);
        assert!(
            h.notification
                .failure_reason("ORDER-2")
                .unwrap()
                .contains("inventory not available")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_shipping_is_retried_then_compensated() {
        let h = TestHarness::new();
        h.shipping.set_behaviour(ShippingBehaviour::Stall);

        let started = Instant::now();
        let outcome = h.orchestrator.start(order("ORDER-3")).await.unwrap();
        let elapsed = started.elapsed();

        let failure = outcome.failure().unwrap();
        assert_eq!(failure.failed_step, SHIP_ORDER);
        assert_eq!(failure.cause.kind, StepErrorKind::StaleHeartbeat);
        assert_eq!(
            compensated_steps(&outcome),
            vec![
                (CHECK_INVENTORY.to_string(), true),
                (PROCESS_PAYMENT.to_string(), true)
            ]
        );

        // Five attempts, each stale after 15 s, with 2 + 4 + 8 + 16 s backoff
        assert_eq!(h.shipping.ship_calls(), 5);
        assert!(elapsed >= Duration::from_secs(5 * 15 + 30), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(5 * 25 + 30), "{elapsed:?}");

        let saga = h.orchestrator.get_saga(&order("ORDER-3")).await.unwrap().unwrap();
        let ship = saga.step_named(SHIP_ORDER).unwrap();
        assert_eq!(ship.attempt, 5);
        assert!(ship.is_terminally_failed());

        // Shipping never succeeded, so it is not cancelled
        assert_eq!(h.shipping.cancel_calls(), 0);
        assert_eq!(h.inventory.restock_count(), 1);
        assert_eq!(h.payment.refund_count(), 1);
        assert_eq!(h.notification.failure_notice_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn notification_failure_compensates_everything_in_reverse() {
        let h = TestHarness::new();
        h.notification.set_fail_on_notify(true);

        let outcome = h.orchestrator.start(order("ORDER-4")).await.unwrap();

        let failure = outcome.failure().unwrap();
        assert_eq!(failure.failed_step, NOTIFY_CUSTOMER);
        assert_eq!(failure.cause.kind, StepErrorKind::PermanentCollaboratorError);
        assert_eq!(
            compensated_steps(&outcome),
            vec![
                (SHIP_ORDER.to_string(), true),
                (CHECK_INVENTORY.to_string(), true),
                (PROCESS_PAYMENT.to_string(), true)
            ]
        );

        assert_eq!(h.notification.notify_calls(), 1);
        assert!(h.shipping.is_cancelled("ORDER-4"));
        assert!(!h.inventory.is_reserved("ORDER-4"));
        assert!(h.payment.is_refunded("ORDER-4"));
        assert_eq!(h.notification.failure_notice_calls(), 1);

        // Compensation records appear in reverse order of forward success
        let compensated: Vec<_> = h
            .records("ORDER-4")
            .await
            .into_iter()
            .filter(|r| r.record_type == RecordType::CompensationFinished)
            .filter_map(|r| r.step_name)
            .collect();
        assert_eq!(compensated, vec![SHIP_ORDER, CHECK_INVENTORY, PROCESS_PAYMENT]);
    }
}

mod retries {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let h = TestHarness::new();
        h.payment.fail_next_charges(2);

        let outcome = h.orchestrator.start(order("ORDER-5")).await.unwrap();

        assert!(outcome.is_completed());
        assert_eq!(h.payment.charge_calls(), 3);
        assert_eq!(h.payment.charge_count(), 1);
        assert_eq!(h.count("ORDER-5", RecordType::StepFailed).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_max_attempts_before_terminal_failure() {
        let h = TestHarness::new();
        h.payment.fail_next_charges(100);

        let started = Instant::now();
        let outcome = h.orchestrator.start(order("ORDER-6")).await.unwrap();

        let failure = outcome.failure().unwrap();
        assert_eq!(failure.failed_step, PROCESS_PAYMENT);
        assert_eq!(failure.cause.kind, StepErrorKind::TransientCollaboratorError);
        assert!(failure.compensations.is_empty());
        assert!(failure.customer_notified);

        assert_eq!(h.payment.charge_calls(), 5);
        assert_eq!(h.payment.refund_calls(), 0);
        assert!(started.elapsed() >= Duration::from_secs(2 + 4 + 8 + 16));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let h = TestHarness::new();
        h.payment.set_fail_on_charge(true);

        let outcome = h.orchestrator.start(order("ORDER-7")).await.unwrap();

        let failure = outcome.failure().unwrap();
        assert_eq!(failure.cause.kind, StepErrorKind::PermanentCollaboratorError);
        assert_eq!(h.payment.charge_calls(), 1);
        assert_eq!(h.inventory.check_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shipping_recovers_after_a_failed_attempt() {
        let h = TestHarness::new();
        h.shipping.fail_next_shipments(1);

        let outcome = h.orchestrator.start(order("ORDER-8")).await.unwrap();

        assert_eq!(outcome.tracking_id(), Some("TRACK-ORDER-8"));
        assert_eq!(h.shipping.ship_calls(), 2);
        assert_eq!(h.shipping.shipment_count(), 1);
    }
}

mod compensation {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn failed_compensation_does_not_stop_the_rollback() {
        let h = TestHarness::new();
        h.notification.set_fail_on_notify(true);
        h.inventory.set_fail_on_restock(true);

        let outcome = h.orchestrator.start(order("ORDER-9")).await.unwrap();

        assert_eq!(
            compensated_steps(&outcome),
            vec![
                (SHIP_ORDER.to_string(), true),
                (CHECK_INVENTORY.to_string(), false),
                (PROCESS_PAYMENT.to_string(), true)
            ]
        );
        let restock = &outcome.failure().unwrap().compensations[1];
        match &restock.outcome {
            CompensationOutcome::Failed(error) => {
                assert_eq!(error.kind, StepErrorKind::CompensationError)
            }
            other => panic!("Expected failed compensation, got {other:?}"),
        }

        // Compensations run once, even when they fail
        assert_eq!(h.inventory.restock_calls(), 1);
        assert!(h.payment.is_refunded("ORDER-9"));

        let saga = h.orchestrator.get_saga(&order("ORDER-9")).await.unwrap().unwrap();
        assert_eq!(saga.status(), SagaStatus::Failed);
        assert_eq!(
            saga.step_named(CHECK_INVENTORY).unwrap().status,
            StepStatus::CompensationFailed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn undelivered_failure_notice_still_fails_the_saga() {
        let h = TestHarness::new();
        h.inventory.set_available(false);
        h.notification.set_fail_on_failure_notice(true);

        let outcome = h.orchestrator.start(order("ORDER-10")).await.unwrap();

        assert!(!outcome.failure().unwrap().customer_notified);
        assert_eq!(h.notification.failure_notice_calls(), 1);
        assert_eq!(h.count("ORDER-10", RecordType::FailureNotified).await, 1);
        assert_eq!(h.count("ORDER-10", RecordType::SagaFailed).await, 1);
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn starting_a_finished_saga_returns_its_outcome() {
        let h = TestHarness::new();

        let first = h.orchestrator.start(order("ORDER-11")).await.unwrap();
        let records = h.log.record_count().await;
        let second = h.orchestrator.start(order("ORDER-11")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.log.record_count().await, records);
        assert_eq!(h.payment.charge_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_running_saga_cannot_be_started_twice() {
        let h = TestHarness::new();

        let handle = h.orchestrator.spawn(order("ORDER-12")).unwrap();
        assert_eq!(handle.saga_id(), &order("ORDER-12"));
        assert!(h.orchestrator.is_running(&order("ORDER-12")));

        let second = h.orchestrator.start(order("ORDER-12")).await;
        assert!(matches!(second, Err(SagaError::AlreadyRunning(_))));
        assert!(matches!(
            h.orchestrator.spawn(order("ORDER-12")),
            Err(SagaError::AlreadyRunning(_))
        ));

        let outcome = handle.join().await.unwrap();
        assert!(outcome.is_completed());
        assert!(!h.orchestrator.is_running(&order("ORDER-12")));
    }

    #[tokio::test(start_paused = true)]
    async fn a_caller_that_stops_waiting_does_not_strand_the_saga() {
        let h = TestHarness::new();

        // Payment and inventory are done; shipping is mid-heartbeat
        let waited = tokio::time::timeout(
            Duration::from_millis(3500),
            h.orchestrator.start(order("ORDER-13")),
        )
        .await;
        assert!(waited.is_err());
        assert!(h.orchestrator.is_running(&order("ORDER-13")));

        // Nobody else may drive it while the detached run is live
        assert!(matches!(
            h.orchestrator.start(order("ORDER-13")).await,
            Err(SagaError::AlreadyRunning(_))
        ));

        tokio::time::sleep(Duration::from_secs(600)).await;

        let saga = h.orchestrator.get_saga(&order("ORDER-13")).await.unwrap().unwrap();
        assert_eq!(saga.status(), SagaStatus::Completed);
        assert!(!h.orchestrator.is_running(&order("ORDER-13")));
        assert_eq!(h.payment.charge_calls(), 1);
        assert_eq!(h.shipping.ship_calls(), 1);
        assert_eq!(h.count("ORDER-13", RecordType::SagaCompleted).await, 1);

        let outcome = h.orchestrator.start(order("ORDER-13")).await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(h.shipping.ship_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_sagas_are_independent() {
        let h = TestHarness::new();
        let handles: Vec<_> = (0..5)
            .map(|i| h.orchestrator.spawn(order(&format!("ORDER-C{i}"))).unwrap())
            .collect();

        for handle in handles {
            assert!(handle.join().await.unwrap().is_completed());
        }
        assert_eq!(h.payment.charge_count(), 5);
        assert_eq!(h.shipping.shipment_count(), 5);
    }

    #[tokio::test]
    async fn blank_order_id_is_rejected() {
        let h = TestHarness::new();
        let result = h.orchestrator.start(order("  ")).await;
        assert!(matches!(result, Err(SagaError::InvalidOrderId(_))));
    }

    #[tokio::test]
    async fn unknown_saga() {
        let h = TestHarness::new();
        assert!(h.orchestrator.get_saga(&order("nope")).await.unwrap().is_none());
        assert!(matches!(
            h.orchestrator.resume(order("nope")).await,
            Err(SagaError::NotFound(_))
        ));
    }
}

mod recovery {
    use super::*;

    async fn completed_run(order_id: &str) -> Vec<LogRecord> {
        let h = TestHarness::new();
        h.orchestrator.start(order(order_id)).await.unwrap();
        h.records(order_id).await
    }

    #[tokio::test(start_paused = true)]
    async fn resuming_after_any_succeeded_step_completes_without_rerunning_it() {
        let records = completed_run("ORDER-R").await;
        let cuts: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.record_type == RecordType::StepSucceeded)
            .map(|(i, _)| i + 1)
            .collect();
        assert_eq!(cuts.len(), 4);

        for cut in cuts {
            let truncated = records[..cut].to_vec();
            let done: Vec<String> = truncated
                .iter()
                .filter(|r| r.record_type == RecordType::StepSucceeded)
                .filter_map(|r| r.step_name.clone())
                .collect();

            let h = TestHarness::with_log(InMemoryDurableLog::from_records(truncated));
            let outcome = h.orchestrator.resume(order("ORDER-R")).await.unwrap();
            assert_eq!(outcome.tracking_id(), Some("TRACK-ORDER-R"), "cut at {cut}");

            let calls = [
                (PROCESS_PAYMENT, h.payment.charge_calls()),
                (CHECK_INVENTORY, h.inventory.check_calls()),
                (NOTIFY_CUSTOMER, h.notification.notify_calls()),
            ];
            for (step, calls) in calls {
                let expected = if done.iter().any(|d| d == step) { 0 } else { 1 };
                assert_eq!(calls, expected, "{step} after cut at {cut}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_step_is_redriven_with_next_attempt() {
        let records = completed_run("ORDER-S").await;
        // Crash while shipping: keep everything up to its third heartbeat
        let cut = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.record_type == RecordType::StepHeartbeat)
            .nth(2)
            .map(|(i, _)| i + 1)
            .unwrap();

        let h = TestHarness::with_log(InMemoryDurableLog::from_records(records[..cut].to_vec()));
        let before = h.orchestrator.get_saga(&order("ORDER-S")).await.unwrap().unwrap();
        assert_eq!(before.step_named(SHIP_ORDER).unwrap().status, StepStatus::Running);

        let outcome = h.orchestrator.resume(order("ORDER-S")).await.unwrap();
        assert!(outcome.is_completed());

        let saga = h.orchestrator.get_saga(&order("ORDER-S")).await.unwrap().unwrap();
        assert_eq!(saga.step_named(SHIP_ORDER).unwrap().attempt, 2);
        assert_eq!(h.payment.charge_calls(), 0);
        assert_eq!(h.shipping.ship_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_compensation_is_finished() {
        let h = TestHarness::new();
        h.notification.set_fail_on_notify(true);
        h.orchestrator.start(order("ORDER-T")).await.unwrap();
        let records = h.records("ORDER-T").await;

        // Crash after the first compensation started
        let cut = records
            .iter()
            .position(|r| r.record_type == RecordType::CompensationStarted)
            .unwrap()
            + 1;
        let h = TestHarness::with_log(InMemoryDurableLog::from_records(records[..cut].to_vec()));
        let outcome = h.orchestrator.resume(order("ORDER-T")).await.unwrap();

        assert_eq!(
            compensated_steps(&outcome),
            vec![
                (SHIP_ORDER.to_string(), true),
                (CHECK_INVENTORY.to_string(), true),
                (PROCESS_PAYMENT.to_string(), true)
            ]
        );
        // The fresh carrier never shipped, so the cancellation is a no-op
        assert_eq!(h.shipping.cancel_calls(), 1);
        assert_eq!(h.inventory.restock_calls(), 1);
        assert_eq!(h.payment.refund_calls(), 1);
        assert_eq!(h.notification.failure_notice_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recover_all_resumes_every_active_saga() {
        let mut records = Vec::new();
        for id in ["ORDER-X", "ORDER-Y"] {
            let run = completed_run(id).await;
            records.extend(run.into_iter().take(3));
        }
        let finished = completed_run("ORDER-Z").await;
        records.extend(finished);

        let h = TestHarness::with_log(InMemoryDurableLog::from_records(records));
        assert_eq!(h.log.active_sagas().await.unwrap().len(), 2);

        let recovered = h.orchestrator.recover_all().await.unwrap();
        assert_eq!(recovered.len(), 2);
        for (saga_id, result) in recovered {
            let outcome = result.unwrap();
            assert_eq!(
                outcome.tracking_id(),
                Some(format!("TRACK-{saga_id}").as_str())
            );
        }
        assert!(h.log.active_sagas().await.unwrap().is_empty());
        assert_eq!(h.payment.charge_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_instance_matches_the_live_one() {
        let h = TestHarness::new();
        h.notification.set_fail_on_notify(true);
        h.orchestrator.start(order("ORDER-U")).await.unwrap();

        let records = h.records("ORDER-U").await;
        let mut replayed = domain::SagaInstance::default();
        replayed.replay(records).unwrap();

        // The archived snapshot is the live instance at its end
        let live = h.orchestrator.get_saga(&order("ORDER-U")).await.unwrap().unwrap();
        assert_eq!(replayed.steps(), live.steps());
        assert_eq!(replayed.status(), SagaStatus::Failed);
        assert_eq!(replayed.sequence(), live.sequence());
    }
}
