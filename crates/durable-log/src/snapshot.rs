use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SagaId, SequenceNo};

/// A snapshot of a saga instance at a specific sequence number.
///
/// The orchestrator writes one when a saga reaches a terminal status, which
/// archives the instance: queries and recovery load the snapshot instead of
/// replaying the full log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// The saga this snapshot belongs to.
    pub saga_id: SagaId,

    /// The saga definition the saga runs.
    pub saga_type: String,

    /// The last sequence number folded into the snapshot.
    pub sequence: SequenceNo,

    /// When the snapshot was created.
    pub timestamp: DateTime<Utc>,

    /// The serialized saga instance.
    pub state: serde_json::Value,
}

impl Snapshot {
    /// Creates a new snapshot.
    pub fn new(
        saga_id: SagaId,
        saga_type: impl Into<String>,
        sequence: SequenceNo,
        state: serde_json::Value,
    ) -> Self {
        Self {
            saga_id,
            saga_type: saga_type.into(),
            sequence,
            timestamp: Utc::now(),
            state,
        }
    }

    /// Creates a snapshot from a serializable state.
    pub fn from_state<T: Serialize>(
        saga_id: SagaId,
        saga_type: impl Into<String>,
        sequence: SequenceNo,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            saga_id,
            saga_type,
            sequence,
            serde_json::to_value(state)?,
        ))
    }

    /// Deserializes the snapshot state into a concrete type.
    pub fn into_state<T: for<'de> Deserialize<'de>>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }
}
