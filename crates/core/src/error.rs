//! Domain error model for the signal bus.

use thiserror::Error;

/// Result type used across the domain layer.
pub type SignalResult<T> = Result<T, SignalError>;

/// Domain-level error.
///
/// Keep this focused on deterministic configuration/registration failures.
/// Store and broker concerns have their own error types in their crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// A signal name was flushed or looked up without being registered.
    #[error("unknown signal type: {0}")]
    UnknownSignal(String),

    /// A signal type was registered twice under the same name.
    #[error("signal type already registered: {0}")]
    AlreadyRegistered(String),

    /// An ordered operation was requested for a type without an order key.
    #[error("signal type \"{0}\" does not declare an order key")]
    NotOrdered(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A descriptor field failed validation.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
}

impl SignalError {
    pub fn unknown_signal(name: impl Into<String>) -> Self {
        Self::UnknownSignal(name.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_descriptor(msg: impl Into<String>) -> Self {
        Self::InvalidDescriptor(msg.into())
    }
}
