//! Liveness tracking of long-running steps.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Tracked {
    interval: Duration,
    start_to_close: Duration,
    started_at: Instant,
    last_heartbeat_at: Option<Instant>,
    details: Option<serde_json::Value>,
}

/// Tracks heartbeats of running steps on the monotonic clock.
///
/// A step is stale when its last heartbeat is older than its heartbeat
/// interval. A step that never heartbeat is only stale once its
/// start-to-close timeout has passed.
#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    steps: HashMap<String, Tracked>,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a step. Replaces an earlier registration.
    pub fn register(
        &mut self,
        step_id: impl Into<String>,
        interval: Duration,
        start_to_close: Duration,
        started_at: Instant,
    ) {
        self.steps.insert(
            step_id.into(),
            Tracked {
                interval,
                start_to_close,
                started_at,
                last_heartbeat_at: None,
                details: None,
            },
        );
    }

    /// Records a heartbeat received now.
    ///
    /// Returns false if the step is not registered.
    pub fn record_heartbeat(&mut self, step_id: &str, details: Option<serde_json::Value>) -> bool {
        self.record_heartbeat_at(step_id, details, Instant::now())
    }

    /// Records a heartbeat sent at `at`.
    pub fn record_heartbeat_at(
        &mut self,
        step_id: &str,
        details: Option<serde_json::Value>,
        at: Instant,
    ) -> bool {
        let Some(tracked) = self.steps.get_mut(step_id) else {
            return false;
        };
        // Heartbeats may arrive out of order through the channel
        if tracked.last_heartbeat_at.is_none_or(|last| at >= last) {
            tracked.last_heartbeat_at = Some(at);
            tracked.details = details;
        }
        true
    }

    /// Returns true if the step missed its heartbeat deadline at `now`.
    pub fn is_stale(&self, step_id: &str, now: Instant) -> bool {
        let Some(tracked) = self.steps.get(step_id) else {
            return false;
        };
        match tracked.last_heartbeat_at {
            Some(last) => now.saturating_duration_since(last) > tracked.interval,
            None => now.saturating_duration_since(tracked.started_at) > tracked.start_to_close,
        }
    }

    pub fn last_heartbeat(&self, step_id: &str) -> Option<Instant> {
        self.steps.get(step_id)?.last_heartbeat_at
    }

    /// Returns the details of the latest heartbeat.
    pub fn details(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.steps.get(step_id)?.details.as_ref()
    }

    /// Stops tracking a step.
    pub fn deregister(&mut self, step_id: &str) {
        self.steps.remove(step_id);
    }

    pub fn is_registered(&self, step_id: &str) -> bool {
        self.steps.contains_key(step_id)
    }
}
