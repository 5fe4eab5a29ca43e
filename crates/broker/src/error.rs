//! Broker error model.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The connection or channel failed. The caller must open a fresh
    /// channel before the next operation.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// The broker stopped responding within the deadline.
    #[error("broker operation timed out after {0:?}")]
    Timeout(Duration),

    /// The channel was closed by the broker (e.g. queue deleted,
    /// consumer cancelled).
    #[error("broker channel closed")]
    ChannelClosed,
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Clean end of a consumption loop, requested through its stop handle.
/// Anything else ends the loop with a [`BrokerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminatedConsumption;
