//! Shipping service trait and in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::{CollaboratorError, Faults, read, write};
use crate::context::StepContext;

/// Trait for shipping operations.
#[async_trait]
pub trait ShippingService: Send + Sync {
    /// Ships an order and returns its tracking id.
    ///
    /// Shipping may take long. Implementations heartbeat through `ctx` and
    /// stop when it is cancelled.
    async fn ship_order(&self, order_id: &str, ctx: &StepContext)
    -> Result<String, CollaboratorError>;

    /// Cancels the shipment of an order.
    async fn cancel_shipment(
        &self,
        order_id: &str,
        tracking_id: &str,
    ) -> Result<(), CollaboratorError>;
}

/// How the in-memory carrier behaves when asked to ship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShippingBehaviour {
    /// Works in `heartbeats` chunks of `step_delay`, heartbeating after each.
    Succeed {
        heartbeats: u32,
        step_delay: Duration,
    },
    /// Heartbeats once, then hangs until cancelled.
    Stall,
}

impl Default for ShippingBehaviour {
    fn default() -> Self {
        ShippingBehaviour::Succeed {
            heartbeats: 10,
            step_delay: Duration::from_secs(1),
        }
    }
}

impl ShippingBehaviour {
    /// Ships without delay, for tests on a real clock.
    pub fn instant() -> Self {
        ShippingBehaviour::Succeed {
            heartbeats: 1,
            step_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct InMemoryShippingState {
    behaviour: ShippingBehaviour,
    shipments: HashMap<String, String>,
    cancelled: HashSet<String>,
    ship_calls: u32,
    cancel_calls: u32,
    ship_faults: Faults,
    cancel_faults: Faults,
}

/// In-memory shipping service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShippingService {
    state: Arc<RwLock<InMemoryShippingState>>,
}

impl InMemoryShippingService {
    /// Creates a new in-memory shipping service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a service with the given behaviour.
    pub fn with_behaviour(behaviour: ShippingBehaviour) -> Self {
        let service = Self::default();
        service.set_behaviour(behaviour);
        service
    }

    pub fn set_behaviour(&self, behaviour: ShippingBehaviour) {
        write(&self.state).behaviour = behaviour;
    }

    /// Configures every shipment to fail permanently.
    pub fn set_fail_on_ship(&self, fail: bool) {
        write(&self.state).ship_faults.set_permanent(fail);
    }

    /// Makes the next `times` shipments fail transiently.
    pub fn fail_next_shipments(&self, times: u32) {
        write(&self.state).ship_faults.fail_next(times);
    }

    /// Configures every cancellation to fail permanently.
    pub fn set_fail_on_cancel(&self, fail: bool) {
        write(&self.state).cancel_faults.set_permanent(fail);
    }

    /// Returns the tracking id of a shipped order.
    pub fn tracking_id(&self, order_id: &str) -> Option<String> {
        read(&self.state).shipments.get(order_id).cloned()
    }

    /// Returns true if the shipment of the order was cancelled.
    pub fn is_cancelled(&self, order_id: &str) -> bool {
        read(&self.state).cancelled.contains(order_id)
    }

    /// Number of distinct orders shipped.
    pub fn shipment_count(&self) -> usize {
        read(&self.state).shipments.len()
    }

    /// Number of distinct shipments cancelled.
    pub fn cancel_count(&self) -> usize {
        read(&self.state).cancelled.len()
    }

    pub fn ship_calls(&self) -> u32 {
        read(&self.state).ship_calls
    }

    pub fn cancel_calls(&self) -> u32 {
        read(&self.state).cancel_calls
    }
}

fn progress(chunk: u32) -> Option<serde_json::Value> {
    Some(serde_json::json!(format!("shipping-step-{chunk}")))
}

#[async_trait]
impl ShippingService for InMemoryShippingService {
    async fn ship_order(
        &self,
        order_id: &str,
        ctx: &StepContext,
    ) -> Result<String, CollaboratorError> {
        let behaviour = {
            let mut state = write(&self.state);
            state.ship_calls += 1;
            state.ship_faults.check("shipping")?;
            state.behaviour.clone()
        };

        match behaviour {
            ShippingBehaviour::Succeed {
                heartbeats,
                step_delay,
            } => {
                for chunk in 0..heartbeats {
                    tokio::time::sleep(step_delay).await;
                    ctx.heartbeat(progress(chunk))
                        .await
                        .map_err(|e| CollaboratorError::Transient(format!("shipping interrupted: {e}")))?;
                }
            }
            ShippingBehaviour::Stall => {
                // The first heartbeat may already be refused; the stall follows either way
                let _ = ctx.heartbeat(progress(0)).await;
                ctx.cancelled().await;
                return Err(CollaboratorError::Transient(
                    "shipping interrupted: step was cancelled".to_string(),
                ));
            }
        }

        let mut state = write(&self.state);
        let tracking_id = state
            .shipments
            .entry(order_id.to_string())
            .or_insert_with(|| format!("TRACK-{order_id}"))
            .clone();
        Ok(tracking_id)
    }

    async fn cancel_shipment(
        &self,
        order_id: &str,
        tracking_id: &str,
    ) -> Result<(), CollaboratorError> {
        let mut state = write(&self.state);
        state.cancel_calls += 1;
        state.cancel_faults.check("shipment cancellation")?;

        match state.shipments.get(order_id) {
            Some(known) if known != tracking_id => Err(CollaboratorError::Permanent(format!(
                "tracking id {tracking_id} does not belong to {order_id}"
            ))),
            Some(_) => {
                state.cancelled.insert(order_id.to_string());
                Ok(())
            }
            None => Ok(()),
        }
    }
}
