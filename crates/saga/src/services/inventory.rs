//! Inventory service trait and in-memory implementation.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{CollaboratorError, Faults, read, write};

/// Trait for inventory management operations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Checks stock for an order and reserves it.
    ///
    /// Returns false when the order cannot be served.
    async fn check_inventory(&self, order_id: &str) -> Result<bool, CollaboratorError>;

    /// Releases the reservation of an order.
    async fn restock_inventory(&self, order_id: &str) -> Result<(), CollaboratorError>;
}

#[derive(Debug)]
struct InMemoryInventoryState {
    available: bool,
    reserved: HashSet<String>,
    restocked: HashSet<String>,
    check_calls: u32,
    restock_calls: u32,
    check_faults: Faults,
    restock_faults: Faults,
}

impl Default for InMemoryInventoryState {
    fn default() -> Self {
        Self {
            available: true,
            reserved: HashSet::new(),
            restocked: HashSet::new(),
            check_calls: 0,
            restock_calls: 0,
            check_faults: Faults::default(),
            restock_faults: Faults::default(),
        }
    }
}

/// In-memory inventory service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service with stock for every order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether stock is available.
    pub fn set_available(&self, available: bool) {
        write(&self.state).available = available;
    }

    /// Configures every check to fail permanently.
    pub fn set_fail_on_check(&self, fail: bool) {
        write(&self.state).check_faults.set_permanent(fail);
    }

    /// Makes the next `times` checks fail transiently.
    pub fn fail_next_checks(&self, times: u32) {
        write(&self.state).check_faults.fail_next(times);
    }

    /// Configures every restock to fail permanently.
    pub fn set_fail_on_restock(&self, fail: bool) {
        write(&self.state).restock_faults.set_permanent(fail);
    }

    /// Returns true if stock is currently reserved for the order.
    pub fn is_reserved(&self, order_id: &str) -> bool {
        read(&self.state).reserved.contains(order_id)
    }

    /// Number of orders with reserved stock.
    pub fn reservation_count(&self) -> usize {
        read(&self.state).reserved.len()
    }

    /// Number of distinct orders restocked.
    pub fn restock_count(&self) -> usize {
        read(&self.state).restocked.len()
    }

    pub fn check_calls(&self) -> u32 {
        read(&self.state).check_calls
    }

    pub fn restock_calls(&self) -> u32 {
        read(&self.state).restock_calls
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn check_inventory(&self, order_id: &str) -> Result<bool, CollaboratorError> {
        let mut state = write(&self.state);
        state.check_calls += 1;
        state.check_faults.check("inventory")?;

        if !state.available {
            return Ok(false);
        }
        state.reserved.insert(order_id.to_string());
        Ok(true)
    }

    async fn restock_inventory(&self, order_id: &str) -> Result<(), CollaboratorError> {
        let mut state = write(&self.state);
        state.restock_calls += 1;
        state.restock_faults.check("restock")?;

        if state.reserved.remove(order_id) {
            state.restocked.insert(order_id.to_string());
        }
        Ok(())
    }
}
