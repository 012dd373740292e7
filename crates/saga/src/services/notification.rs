//! Notification service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{CollaboratorError, Faults, read, write};

/// Trait for customer notifications.
#[async_trait]
pub trait NotificationService: Send + Sync {
    /// Tells the customer the order shipped.
    async fn notify_customer(
        &self,
        order_id: &str,
        tracking_id: &str,
    ) -> Result<(), CollaboratorError>;

    /// Tells the customer the order failed and why.
    async fn notify_customer_failure(
        &self,
        order_id: &str,
        reason: &str,
    ) -> Result<(), CollaboratorError>;
}

#[derive(Debug, Default)]
struct InMemoryNotificationState {
    shipped: HashMap<String, String>,
    failures: HashMap<String, String>,
    notify_calls: u32,
    failure_calls: u32,
    notify_faults: Faults,
    failure_faults: Faults,
}

/// In-memory notification service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationService {
    state: Arc<RwLock<InMemoryNotificationState>>,
}

impl InMemoryNotificationService {
    /// Creates a new in-memory notification service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures every success notification to fail permanently.
    pub fn set_fail_on_notify(&self, fail: bool) {
        write(&self.state).notify_faults.set_permanent(fail);
    }

    /// Makes the next `times` success notifications fail transiently.
    pub fn fail_next_notifications(&self, times: u32) {
        write(&self.state).notify_faults.fail_next(times);
    }

    /// Configures every failure notification to fail permanently.
    pub fn set_fail_on_failure_notice(&self, fail: bool) {
        write(&self.state).failure_faults.set_permanent(fail);
    }

    /// Returns the tracking id the customer was told about.
    pub fn notified_tracking_id(&self, order_id: &str) -> Option<String> {
        read(&self.state).shipped.get(order_id).cloned()
    }

    /// Returns the failure reason the customer was told about.
    pub fn failure_reason(&self, order_id: &str) -> Option<String> {
        read(&self.state).failures.get(order_id).cloned()
    }

    /// Number of distinct orders notified of success.
    pub fn notified_count(&self) -> usize {
        read(&self.state).shipped.len()
    }

    /// Number of distinct orders notified of failure.
    pub fn failure_notice_count(&self) -> usize {
        read(&self.state).failures.len()
    }

    pub fn notify_calls(&self) -> u32 {
        read(&self.state).notify_calls
    }

    pub fn failure_notice_calls(&self) -> u32 {
        read(&self.state).failure_calls
    }
}

#[async_trait]
impl NotificationService for InMemoryNotificationService {
    async fn notify_customer(
        &self,
        order_id: &str,
        tracking_id: &str,
    ) -> Result<(), CollaboratorError> {
        let mut state = write(&self.state);
        state.notify_calls += 1;
        state.notify_faults.check("notification")?;

        state
            .shipped
            .entry(order_id.to_string())
            .or_insert_with(|| tracking_id.to_string());
        Ok(())
    }

    async fn notify_customer_failure(
        &self,
        order_id: &str,
        reason: &str,
    ) -> Result<(), CollaboratorError> {
        let mut state = write(&self.state);
        state.failure_calls += 1;
        state.failure_faults.check("failure notification")?;

        state
            .failures
            .entry(order_id.to_string())
            .or_insert_with(|| reason.to_string());
        Ok(())
    }
}
