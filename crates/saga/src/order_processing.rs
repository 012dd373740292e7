//! The order-processing saga: pay, reserve stock, ship, notify.

use async_trait::async_trait;
use common::SagaId;
use domain::{
    RetryPolicy, SagaDefinition, SagaInstance, StepError, StepSpec, TimeoutConfig,
};
use serde_json::json;

use crate::activities::SagaActivities;
use crate::context::StepContext;
use crate::services::{InventoryService, NotificationService, PaymentService, ShippingService};

pub const SAGA_TYPE: &str = "order-processing";

pub const PROCESS_PAYMENT: &str = "processPayment";
pub const CHECK_INVENTORY: &str = "checkInventory";
pub const SHIP_ORDER: &str = "shipOrder";
pub const NOTIFY_CUSTOMER: &str = "notifyCustomer";

pub const REFUND_PAYMENT: &str = "refundPayment";
pub const RESTOCK_INVENTORY: &str = "restockInventory";
pub const CANCEL_SHIPMENT: &str = "cancelShipment";

/// The step list of the order saga.
///
/// Shipping runs in the background with a heartbeat; every other step uses
/// the quick policy. All steps retry transient failures five times.
pub fn definition() -> SagaDefinition {
    SagaDefinition::new(SAGA_TYPE)
        .step(StepSpec::new(PROCESS_PAYMENT).with_compensation(REFUND_PAYMENT))
        .step(StepSpec::new(CHECK_INVENTORY).with_compensation(RESTOCK_INVENTORY))
        .step(
            StepSpec::new(SHIP_ORDER)
                .with_compensation(CANCEL_SHIPMENT)
                .with_timeouts(TimeoutConfig::shipping())
                .with_retry(RetryPolicy::transient())
                .in_background(),
        )
        .step(StepSpec::new(NOTIFY_CUSTOMER))
}

/// Reads the tracking id out of a `shipOrder` result.
fn tracking_id_of(result: &serde_json::Value) -> Option<&str> {
    result.get("tracking_id")?.as_str()
}

/// Maps the order saga's step names onto the collaborator services.
#[derive(Debug, Clone)]
pub struct OrderActivities<P, I, S, N> {
    payment: P,
    inventory: I,
    shipping: S,
    notification: N,
}

impl<P, I, S, N> OrderActivities<P, I, S, N>
where
    P: PaymentService,
    I: InventoryService,
    S: ShippingService,
    N: NotificationService,
{
    pub fn new(payment: P, inventory: I, shipping: S, notification: N) -> Self {
        Self {
            payment,
            inventory,
            shipping,
            notification,
        }
    }

    fn shipped_tracking_id(ctx: &StepContext) -> Result<String, StepError> {
        ctx.result(SHIP_ORDER)
            .and_then(tracking_id_of)
            .map(str::to_string)
            .ok_or_else(|| StepError::permanent(format!("no tracking id for {}", ctx.order_id())))
    }
}

#[async_trait]
impl<P, I, S, N> SagaActivities for OrderActivities<P, I, S, N>
where
    P: PaymentService,
    I: InventoryService,
    S: ShippingService,
    N: NotificationService,
{
    async fn execute(&self, step: &str, ctx: StepContext) -> Result<serde_json::Value, StepError> {
        let order_id = ctx.order_id();

        match step {
            PROCESS_PAYMENT => {
                self.payment.process_payment(order_id).await?;
                Ok(json!({ "charged": true }))
            }
            CHECK_INVENTORY => {
                if !self.inventory.check_inventory(order_id).await? {
                    return Err(StepError::business_rule(format!(
                        "inventory not available for {order_id}"
                    )));
                }
                Ok(json!({ "reserved": true }))
            }
            SHIP_ORDER => {
                let tracking_id = self.shipping.ship_order(order_id, &ctx).await?;
                Ok(json!({ "tracking_id": tracking_id }))
            }
            NOTIFY_CUSTOMER => {
                let tracking_id = Self::shipped_tracking_id(&ctx)?;
                self.notification
                    .notify_customer(order_id, &tracking_id)
                    .await?;
                Ok(json!({ "notified": true }))
            }
            other => Err(StepError::permanent(format!("unknown step '{other}'"))),
        }
    }

    async fn compensate(&self, step: &str, ctx: StepContext) -> Result<(), StepError> {
        let order_id = ctx.order_id();

        match step {
            PROCESS_PAYMENT => Ok(self.payment.refund_payment(order_id).await?),
            CHECK_INVENTORY => Ok(self.inventory.restock_inventory(order_id).await?),
            SHIP_ORDER => {
                let tracking_id = Self::shipped_tracking_id(&ctx)?;
                Ok(self
                    .shipping
                    .cancel_shipment(order_id, &tracking_id)
                    .await?)
            }
            other => Err(StepError::permanent(format!(
                "step '{other}' has no compensation"
            ))),
        }
    }

    async fn notify_failure(&self, saga_id: &SagaId, reason: &str) -> Result<(), StepError> {
        Ok(self
            .notification
            .notify_customer_failure(saga_id.order_id(), reason)
            .await?)
    }

    fn tracking_id(&self, instance: &SagaInstance) -> Option<String> {
        instance
            .step_named(SHIP_ORDER)?
            .result
            .as_ref()
            .and_then(tracking_id_of)
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelSignal;
    use crate::services::{
        InMemoryInventoryService, InMemoryNotificationService, InMemoryPaymentService,
        InMemoryShippingService, ShippingBehaviour,
    };
    use domain::{ExecutionMode, StepErrorKind};
    use std::collections::HashMap;
    use std::time::Duration;

    type Activities = OrderActivities<
        InMemoryPaymentService,
        InMemoryInventoryService,
        InMemoryShippingService,
        InMemoryNotificationService,
    >;

    fn activities() -> (Activities, InMemoryInventoryService, InMemoryNotificationService) {
        let inventory = InMemoryInventoryService::new();
        let notification = InMemoryNotificationService::new();
        let activities = OrderActivities::new(
            InMemoryPaymentService::new(),
            inventory.clone(),
            InMemoryShippingService::with_behaviour(ShippingBehaviour::instant()),
            notification.clone(),
        );
        (activities, inventory, notification)
    }

    fn context(step: &str) -> StepContext {
        StepContext::new(SagaId::new("ORDER-1"), step, 1, 5, CancelSignal::never())
    }

    #[test]
    fn test_definition() {
        let def = definition();
        assert!(def.validate().is_ok());

        let names: Vec<_> = def.steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            [PROCESS_PAYMENT, CHECK_INVENTORY, SHIP_ORDER, NOTIFY_CUSTOMER]
        );

        let ship = def.find(SHIP_ORDER).unwrap();
        assert_eq!(ship.mode, ExecutionMode::Background);
        assert_eq!(ship.timeouts.heartbeat_interval, Some(Duration::from_secs(15)));
        assert_eq!(ship.retry.max_attempts, 5);
        assert!(def.find(NOTIFY_CUSTOMER).unwrap().compensation.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_inventory_is_a_business_rule_failure() {
        let (activities, inventory, _) = activities();
        inventory.set_available(false);

        let error = activities
            .execute(CHECK_INVENTORY, context(CHECK_INVENTORY))
            .await
            .unwrap_err();
        assert_eq!(error.kind, StepErrorKind::BusinessRuleFailure);
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn test_notify_uses_tracking_id_of_shipping() {
        let (activities, _, notification) = activities();

        let result = activities
            .execute(SHIP_ORDER, context(SHIP_ORDER))
            .await
            .unwrap();
        assert_eq!(tracking_id_of(&result), Some("TRACK-ORDER-1"));

        let ctx = context(NOTIFY_CUSTOMER)
            .with_results(HashMap::from([(SHIP_ORDER.to_string(), result)]));
        activities.execute(NOTIFY_CUSTOMER, ctx).await.unwrap();
        assert_eq!(
            notification.notified_tracking_id("ORDER-1").as_deref(),
            Some("TRACK-ORDER-1")
        );
    }

    #[tokio::test]
    async fn test_notify_without_shipment_fails_permanently() {
        let (activities, _, _) = activities();
        let error = activities
            .execute(NOTIFY_CUSTOMER, context(NOTIFY_CUSTOMER))
            .await
            .unwrap_err();
        assert_eq!(error.kind, StepErrorKind::PermanentCollaboratorError);
    }

    #[tokio::test]
    async fn test_unknown_steps() {
        let (activities, _, _) = activities();
        assert!(activities.execute("bogus", context("bogus")).await.is_err());
        assert!(
            activities
                .compensate(NOTIFY_CUSTOMER, context(NOTIFY_CUSTOMER))
                .await
                .is_err()
        );
    }
}
