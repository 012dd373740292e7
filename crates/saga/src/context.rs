//! Step execution context.

use std::collections::HashMap;

use common::SagaId;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// A liveness signal sent by a running step.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    /// Optional progress details
    pub details: Option<serde_json::Value>,

    /// When the heartbeat was sent
    pub at: Instant,
}

/// Error from heartbeat operations.
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// The runner stopped listening (attempt over)
    #[error("heartbeat channel closed")]
    ChannelClosed,

    /// The attempt was cancelled
    #[error("step was cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag observed by a running action.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Handle that fires a [`CancelSignal`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelSignal {
    /// Creates a linked handle and signal.
    pub fn pair() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self::pair().1
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    ///
    /// Never resolves if the handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl CancelHandle {
    /// Cancel the action
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Context handed to a step action for one attempt.
///
/// The context provides:
/// - The saga (order) id, used as idempotency key
/// - Information about the current attempt
/// - Results of the steps that already succeeded
/// - Heartbeats for long-running steps
/// - Cancellation detection
#[derive(Debug, Clone)]
pub struct StepContext {
    pub saga_id: SagaId,

    pub step: String,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    results: HashMap<String, serde_json::Value>,

    heartbeat_tx: Option<mpsc::Sender<Heartbeat>>,

    cancel: CancelSignal,
}

impl StepContext {
    pub fn new(
        saga_id: SagaId,
        step: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            saga_id,
            step: step.into(),
            attempt,
            max_attempts,
            results: HashMap::new(),
            heartbeat_tx: None,
            cancel,
        }
    }

    /// Create a context with heartbeat support
    pub fn with_heartbeat(mut self, tx: mpsc::Sender<Heartbeat>) -> Self {
        self.heartbeat_tx = Some(tx);
        self
    }

    /// Attaches the results of earlier steps.
    pub fn with_results(mut self, results: HashMap<String, serde_json::Value>) -> Self {
        self.results = results;
        self
    }

    /// The order this saga drives.
    pub fn order_id(&self) -> &str {
        self.saga_id.order_id()
    }

    /// Returns the result of an earlier step.
    pub fn result(&self, step: &str) -> Option<&serde_json::Value> {
        self.results.get(step)
    }

    /// Records a heartbeat.
    ///
    /// Returns an error if the attempt was cancelled or the runner stopped
    /// listening; the action should stop working in both cases. Steps
    /// without a heartbeat interval accept and drop heartbeats.
    pub async fn heartbeat(
        &self,
        details: Option<serde_json::Value>,
    ) -> Result<(), HeartbeatError> {
        if self.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }

        if let Some(tx) = &self.heartbeat_tx {
            tx.send(Heartbeat {
                details,
                at: Instant::now(),
            })
            .await
            .map_err(|_| HeartbeatError::ChannelClosed)?;
        }

        Ok(())
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Check if this is the last attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
