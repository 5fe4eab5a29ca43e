//! The recorded signal row.
//!
//! A row's existence in the outbox table means "recorded but not yet
//! confirmed delivered". Rows are created by the producing transaction,
//! read/locked/deleted by the flush engine, and never mutated in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::SignalId;

/// A pending signal as stored in (and loaded from) the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRow {
    /// Primary key, used for locking and deletion.
    pub id: SignalId,
    /// Name of the signal type this row belongs to.
    pub signal: String,
    /// Type-specific payload.
    pub payload: serde_json::Value,
    /// Ordering key value, present only for types that declare one.
    pub position: Option<i64>,
    /// When the producing transaction recorded the row.
    pub created_at: DateTime<Utc>,
}

/// A signal row about to be recorded by a producing transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSignal {
    pub payload: serde_json::Value,
    pub position: Option<i64>,
}

impl NewSignal {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            position: None,
        }
    }

    /// Attach an ordering key value (for types flushed in order).
    pub fn at_position(mut self, position: i64) -> Self {
        self.position = Some(position);
        self
    }

    /// Materialize the stored row for a signal type.
    pub fn into_row(self, signal: impl Into<String>) -> SignalRow {
        SignalRow {
            id: SignalId::new(),
            signal: signal.into(),
            payload: self.payload,
            position: self.position,
            created_at: Utc::now(),
        }
    }
}
