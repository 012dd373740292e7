//! Durable, append-only log of saga state transitions.
//!
//! Every transition of a saga instance is appended here before the
//! orchestrator acts on it. Recovery rebuilds an instance by folding its
//! records in sequence order. Appends are serialized per saga by a
//! compare-and-swap on the expected sequence number.

pub mod error;
pub mod log;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod record;
pub mod snapshot;

pub use common::SagaId;
pub use error::{DurableLogError, Result};
pub use log::{AppendOptions, DurableLog, DurableLogExt, RecordStream};
pub use memory::InMemoryDurableLog;
pub use postgres::PostgresDurableLog;
pub use query::LogQuery;
pub use record::{LogRecord, LogRecordBuilder, RecordId, RecordType, SequenceNo};
pub use snapshot::Snapshot;
