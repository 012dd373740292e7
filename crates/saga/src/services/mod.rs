//! Collaborator traits and in-memory implementations for saga steps.
//!
//! Every collaborator action is keyed on the order id and must be
//! idempotent: the orchestrator re-drives actions after retries and
//! restarts. The in-memory services count distinct effects separately from
//! calls so tests can verify this.

pub mod inventory;
pub mod notification;
pub mod payment;
pub mod shipping;

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use domain::StepError;
use thiserror::Error;

pub use inventory::{InMemoryInventoryService, InventoryService};
pub use notification::{InMemoryNotificationService, NotificationService};
pub use payment::{InMemoryPaymentService, PaymentService};
pub use shipping::{InMemoryShippingService, ShippingBehaviour, ShippingService};

/// Error returned by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// The call may succeed when retried.
    #[error("{0}")]
    Transient(String),

    /// Retrying will not help.
    #[error("{0}")]
    Permanent(String),
}

impl From<CollaboratorError> for StepError {
    fn from(error: CollaboratorError) -> Self {
        match error {
            CollaboratorError::Transient(message) => StepError::transient(message),
            CollaboratorError::Permanent(message) => StepError::permanent(message),
        }
    }
}

/// Injected failures of one fake operation.
#[derive(Debug, Default)]
pub(crate) struct Faults {
    transient_remaining: u32,
    permanent: bool,
}

impl Faults {
    pub(crate) fn fail_next(&mut self, times: u32) {
        self.transient_remaining = times;
    }

    pub(crate) fn set_permanent(&mut self, fail: bool) {
        self.permanent = fail;
    }

    /// Consumes one injected failure, if any.
    pub(crate) fn check(&mut self, operation: &str) -> Result<(), CollaboratorError> {
        if self.permanent {
            return Err(CollaboratorError::Permanent(format!("{operation} rejected")));
        }
        if self.transient_remaining > 0 {
            self.transient_remaining -= 1;
            return Err(CollaboratorError::Transient(format!(
                "{operation} temporarily unavailable"
            )));
        }
        Ok(())
    }
}

// Fakes keep working after a panicking test thread poisoned the lock.
pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
