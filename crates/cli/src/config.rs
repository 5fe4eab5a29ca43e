//! JSON configuration describing the registered signal types.
//!
//! ```json
//! {
//!   "signals": [
//!     { "name": "transfer", "burst_count": 100 },
//!     { "name": "ledger_entry", "order_key": ["position"], "auto_flush": false }
//!   ]
//! }
//! ```

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use signalbus_core::SignalDescriptor;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub signals: Vec<SignalConfig>,
}

#[derive(Debug, Deserialize)]
pub struct SignalConfig {
    pub name: String,
    /// Defaults to `<name>_signal`.
    pub table: Option<String>,
    /// Defaults to 1.
    pub burst_count: Option<u32>,
    /// Defaults to true.
    pub auto_flush: Option<bool>,
    /// Present only for ordered types.
    pub order_key: Option<Vec<String>>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        if config.signals.is_empty() {
            anyhow::bail!("config declares no signal types");
        }
        Ok(config)
    }
}

impl SignalConfig {
    pub fn into_descriptor(self) -> anyhow::Result<SignalDescriptor> {
        let mut descriptor = SignalDescriptor::new(&self.name);
        if let Some(table) = self.table {
            descriptor = descriptor.with_table(table);
        }
        if let Some(burst_count) = self.burst_count {
            descriptor = descriptor
                .with_burst_count(burst_count)
                .with_context(|| format!("signal \"{}\"", self.name))?;
        }
        if let Some(auto_flush) = self.auto_flush {
            descriptor = descriptor.with_auto_flush(auto_flush);
        }
        if let Some(order_key) = self.order_key {
            descriptor = descriptor.with_order_key(order_key);
        }
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_signal_gets_defaults() {
        let config: Config = serde_json::from_str(r#"{ "signals": [{ "name": "transfer" }] }"#)
            .unwrap();
        let descriptor = config
            .signals
            .into_iter()
            .next()
            .unwrap()
            .into_descriptor()
            .unwrap();
        assert_eq!(descriptor.table, "transfer_signal");
        assert_eq!(descriptor.burst_count.get(), 1);
        assert!(descriptor.auto_flush);
        assert!(!descriptor.is_ordered());
    }

    #[test]
    fn full_signal_is_mapped() {
        let config: Config = serde_json::from_str(
            r#"{
                "signals": [{
                    "name": "ledger_entry",
                    "table": "ledger_entries_outbox",
                    "burst_count": 500,
                    "auto_flush": false,
                    "order_key": ["position"]
                }]
            }"#,
        )
        .unwrap();
        let descriptor = config
            .signals
            .into_iter()
            .next()
            .unwrap()
            .into_descriptor()
            .unwrap();
        assert_eq!(descriptor.table, "ledger_entries_outbox");
        assert_eq!(descriptor.burst_count.get(), 500);
        assert!(!descriptor.auto_flush);
        assert!(descriptor.is_ordered());
    }

    #[test]
    fn zero_burst_count_is_rejected() {
        let config: Config = serde_json::from_str(
            r#"{ "signals": [{ "name": "transfer", "burst_count": 0 }] }"#,
        )
        .unwrap();
        let err = config
            .signals
            .into_iter()
            .next()
            .unwrap()
            .into_descriptor()
            .unwrap_err();
        assert!(err.to_string().contains("transfer"));
    }
}
