//! Saga orchestration for order processing.
//!
//! This crate drives multi-step transactions whose steps each have a
//! compensating action. The order-processing saga runs these steps:
//! 1. Process payment
//! 2. Check and reserve inventory
//! 3. Ship the order (in the background, with heartbeats)
//! 4. Notify the customer
//!
//! Every transition is persisted to the durable log before it takes
//! effect. If a step fails for good, the steps that succeeded are
//! compensated in reverse order and the customer is told. After a crash,
//! sagas are rebuilt from the log and resumed where they stopped.

pub mod activities;
pub mod context;
pub mod error;
pub mod heartbeat;
pub mod journal;
pub mod order_processing;
pub mod orchestrator;
pub mod runner;
pub mod services;
pub mod task;

pub use activities::SagaActivities;
pub use context::{CancelHandle, CancelSignal, Heartbeat, HeartbeatError, StepContext};
pub use error::{Result, SagaError};
pub use heartbeat::HeartbeatMonitor;
pub use journal::SagaJournal;
pub use order_processing::OrderActivities;
pub use orchestrator::{SagaHandle, SagaOrchestrator};
pub use runner::{StepOutcome, StepRunner};
pub use services::{
    CollaboratorError, InMemoryInventoryService, InMemoryNotificationService,
    InMemoryPaymentService, InMemoryShippingService, InventoryService, NotificationService,
    PaymentService, ShippingBehaviour, ShippingService,
};
pub use task::StepTask;

/// Order-processing activities wired to in-memory collaborators.
pub type InMemoryOrderActivities = OrderActivities<
    InMemoryPaymentService,
    InMemoryInventoryService,
    InMemoryShippingService,
    InMemoryNotificationService,
>;
