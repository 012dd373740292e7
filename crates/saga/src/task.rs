//! Background execution of a step.

use std::future::Future;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::context::{CancelHandle, CancelSignal};
use crate::error::{Result, SagaError};

/// A step running on its own tokio task.
///
/// The orchestrator launches the task, keeps going, and later joins it
/// through the result channel. Cancelling, or dropping the task, drops the
/// step's future at its next suspension point.
#[derive(Debug)]
pub struct StepTask<T> {
    step: String,
    cancel: CancelHandle,
    result_rx: oneshot::Receiver<Result<T>>,
    handle: JoinHandle<()>,
}

impl<T: Send + 'static> StepTask<T> {
    /// Spawns `future` for `step`.
    pub fn spawn<F>(step: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let step = step.into();
        let (cancel, signal) = CancelSignal::pair();
        let (result_tx, result_rx) = oneshot::channel();

        let task_step = step.clone();
        let handle = tokio::spawn(async move {
            let result = tokio::select! {
                result = future => result,
                _ = signal.cancelled() => Err(SagaError::TaskAborted {
                    task: task_step,
                    reason: "cancelled".to_string(),
                }),
            };
            // The receiver is gone if the owner stopped waiting
            let _ = result_tx.send(result);
        });

        Self {
            step,
            cancel,
            result_rx,
            handle,
        }
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the step's result.
    pub async fn join(mut self) -> Result<T> {
        match (&mut self.result_rx).await {
            Ok(result) => result,
            Err(_) => Err(SagaError::TaskAborted {
                task: self.step.clone(),
                reason: "task ended without a result".to_string(),
            }),
        }
    }
}

impl<T> Drop for StepTask<T> {
    fn drop(&mut self) {
        // A step must not outlive the driver that records its outcome
        self.cancel.cancel();
    }
}
