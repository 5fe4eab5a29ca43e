//! Error taxonomy for the outbox store and the flush engine.

use signalbus_core::{PublishOutcome, SignalError};
use thiserror::Error;

/// Errors reported by an outbox store adapter.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A serialization failure or deadlock detected by the database.
    /// Transient by definition; the retry executor re-runs the unit of
    /// work in a fresh transaction.
    #[error("serialization conflict: {0}")]
    Serialization(String),

    /// The database connection was lost or could not be established.
    #[error("storage connection error: {0}")]
    Connection(String),

    /// Any other storage failure.
    #[error("storage error during {operation}: {message}")]
    Storage { operation: String, message: String },
}

impl StoreError {
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether this error is a transient transaction conflict.
    pub fn is_serialization(&self) -> bool {
        matches!(self, StoreError::Serialization(_))
    }
}

/// Errors surfaced by flush operations and the retry executor.
#[derive(Debug, Clone, Error)]
pub enum FlushError {
    /// Serialization conflicts persisted through every allowed attempt.
    #[error("transaction conflict persisted after {attempts} attempts")]
    DbSerialization { attempts: u32 },

    /// The sender did not confirm the batch; the transaction was rolled
    /// back and the rows stay pending.
    #[error("publish not confirmed: {0}")]
    NotConfirmed(PublishOutcome),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A misconfiguration such as an unknown or unordered signal type.
    /// These abort the whole invocation instead of being recorded as a
    /// per-type failure.
    #[error(transparent)]
    Signal(#[from] SignalError),
}

impl FlushError {
    /// Whether the retry executor should re-run the unit of work.
    pub fn is_conflict(&self) -> bool {
        matches!(self, FlushError::Store(e) if e.is_serialization())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type FlushResult<T> = Result<T, FlushError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_serialization_errors_are_conflicts() {
        let conflict = FlushError::Store(StoreError::Serialization("40001".into()));
        assert!(conflict.is_conflict());

        let other = FlushError::Store(StoreError::storage("delete", "permission denied"));
        assert!(!other.is_conflict());

        let unconfirmed = FlushError::NotConfirmed(PublishOutcome::TimedOut);
        assert!(!unconfirmed.is_conflict());
    }
}
