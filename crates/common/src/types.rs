use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a saga instance.
///
/// One saga drives one order, so the saga id is the order id itself.
/// Collaborators use it as their idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaId(String);

impl SagaId {
    /// Creates a saga id from an order id.
    pub fn new(order_id: impl Into<String>) -> Self {
        Self(order_id.into())
    }

    /// Creates a fresh, random order id of the form `ORDER-<uuid>`.
    pub fn generate() -> Self {
        Self(format!("ORDER-{}", Uuid::new_v4()))
    }

    /// Returns the order id this saga drives.
    pub fn order_id(&self) -> &str {
        &self.0
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the id is empty or only whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SagaId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SagaId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for SagaId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
