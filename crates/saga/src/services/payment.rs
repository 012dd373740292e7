//! Payment service trait and in-memory implementation.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{CollaboratorError, Faults, read, write};

/// Trait for payment processing operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charges the customer for an order. Charging twice charges once.
    async fn process_payment(&self, order_id: &str) -> Result<(), CollaboratorError>;

    /// Refunds the payment of an order. Refunding twice refunds once.
    async fn refund_payment(&self, order_id: &str) -> Result<(), CollaboratorError>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    charged: HashSet<String>,
    refunded: HashSet<String>,
    charge_calls: u32,
    refund_calls: u32,
    charge_faults: Faults,
    refund_faults: Faults,
}

/// In-memory payment service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures every charge to be declined permanently.
    pub fn set_fail_on_charge(&self, fail: bool) {
        write(&self.state).charge_faults.set_permanent(fail);
    }

    /// Makes the next `times` charges fail transiently.
    pub fn fail_next_charges(&self, times: u32) {
        write(&self.state).charge_faults.fail_next(times);
    }

    /// Configures every refund to fail permanently.
    pub fn set_fail_on_refund(&self, fail: bool) {
        write(&self.state).refund_faults.set_permanent(fail);
    }

    /// Returns true if the order was charged.
    pub fn is_charged(&self, order_id: &str) -> bool {
        read(&self.state).charged.contains(order_id)
    }

    /// Returns true if the order was refunded.
    pub fn is_refunded(&self, order_id: &str) -> bool {
        read(&self.state).refunded.contains(order_id)
    }

    /// Number of distinct orders charged.
    pub fn charge_count(&self) -> usize {
        read(&self.state).charged.len()
    }

    /// Number of distinct orders refunded.
    pub fn refund_count(&self) -> usize {
        read(&self.state).refunded.len()
    }

    pub fn charge_calls(&self) -> u32 {
        read(&self.state).charge_calls
    }

    pub fn refund_calls(&self) -> u32 {
        read(&self.state).refund_calls
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn process_payment(&self, order_id: &str) -> Result<(), CollaboratorError> {
        let mut state = write(&self.state);
        state.charge_calls += 1;
        state.charge_faults.check("payment")?;

        if state.refunded.contains(order_id) {
            return Err(CollaboratorError::Permanent(format!(
                "payment of {order_id} was already refunded"
            )));
        }
        state.charged.insert(order_id.to_string());
        Ok(())
    }

    async fn refund_payment(&self, order_id: &str) -> Result<(), CollaboratorError> {
        let mut state = write(&self.state);
        state.refund_calls += 1;
        state.refund_faults.check("refund")?;

        // Nothing to refund when the charge never went through
        if state.charged.contains(order_id) {
            state.refunded.insert(order_id.to_string());
        }
        Ok(())
    }
}
