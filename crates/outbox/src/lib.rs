//! Transactional outbox storage and flushing.
//!
//! Producers record signal rows inside their own database transaction;
//! the flush engine later sends each row over its registered sender and
//! deletes it in the same transaction, retrying serialization conflicts.
//! Delivery is at-least-once: a crash between send and delete causes a
//! duplicate, never a loss.

pub mod atomic;
pub mod engine;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use atomic::{RetryPolicy, UnitOfWork, with_retry};
pub use engine::{FlushEngine, FlushSummary, PendingReport, SignalFailure};
pub use error::{FlushError, FlushResult, StoreError, StoreResult};
pub use memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
pub use store::{OutboxStore, OutboxTx};
