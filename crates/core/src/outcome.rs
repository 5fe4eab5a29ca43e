//! The result of attempting to publish one message (or one batch).

use serde::{Deserialize, Serialize};

/// Tagged outcome of a publish attempt.
///
/// There is no partial-success state for a batch: a batch is `Confirmed`
/// only when every message in it was acknowledged by the broker. Any other
/// outcome means "not confirmed" and the corresponding rows must stay
/// pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    /// Every message was acknowledged by the broker.
    Confirmed,
    /// The broker explicitly refused a message. Not retried within the
    /// same call; the caller decides whether to retry on a later pass.
    Rejected(String),
    /// The connection or channel dropped mid-call. The publisher must
    /// re-establish the channel before the next call.
    ConnectionLost,
    /// No acknowledgment arrived within the deadline. Delivery status is
    /// unknown; a duplicate send on the next attempt is acceptable.
    TimedOut,
}

impl PublishOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, PublishOutcome::Confirmed)
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        PublishOutcome::Rejected(reason.into())
    }
}

impl std::fmt::Display for PublishOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishOutcome::Confirmed => write!(f, "confirmed"),
            PublishOutcome::Rejected(reason) => write!(f, "rejected: {reason}"),
            PublishOutcome::ConnectionLost => write!(f, "connection lost"),
            PublishOutcome::TimedOut => write!(f, "timed out"),
        }
    }
}
