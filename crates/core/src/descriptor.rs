//! Per-type signal configuration.
//!
//! A descriptor is built once at process startup and registered explicitly;
//! nothing is discovered by reflection or attribute probing.

use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

use crate::error::{SignalError, SignalResult};

/// Static configuration for one signal type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDescriptor {
    /// Unique name of the signal type.
    pub name: String,
    /// Outbox table holding rows of this type.
    pub table: String,
    /// Maximum rows sent and deleted per flush transaction.
    pub burst_count: NonZeroU32,
    /// Whether new rows trigger an immediate flush after the producing
    /// transaction commits.
    pub auto_flush: bool,
    /// Columns forming the ordering key; rows must be delivered in
    /// ascending order of this key when present.
    pub order_key: Option<Vec<String>>,
}

impl SignalDescriptor {
    /// Create a descriptor with defaults: `burst_count = 1`,
    /// `auto_flush = true`, no ordering.
    ///
    /// The outbox table defaults to `<name>_signal`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let table = format!("{name}_signal");
        Self {
            name,
            table,
            burst_count: NonZeroU32::MIN,
            auto_flush: true,
            order_key: None,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_burst_count(mut self, burst_count: u32) -> SignalResult<Self> {
        self.burst_count = NonZeroU32::new(burst_count).ok_or_else(|| {
            SignalError::invalid_descriptor(format!(
                "burst_count for \"{}\" must be positive",
                self.name
            ))
        })?;
        Ok(self)
    }

    pub fn with_auto_flush(mut self, auto_flush: bool) -> Self {
        self.auto_flush = auto_flush;
        self
    }

    pub fn with_order_key(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.order_key = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Whether this type opts into ordered delivery.
    pub fn is_ordered(&self) -> bool {
        self.order_key.is_some()
    }
}
