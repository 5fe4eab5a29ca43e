//! The sender used by the command-line tool.
//!
//! The CLI has no broker configuration of its own; it emits each flushed
//! row as a structured log event and confirms it. Deployments that flush
//! to a real broker register `signalbus_broker::PublisherSender`
//! implementations in their own binaries instead.

use async_trait::async_trait;
use signalbus_core::{PublishOutcome, SignalRow, SignalSender};
use tracing::info;

pub struct LogSender;

#[async_trait]
impl SignalSender for LogSender {
    async fn send_one(&self, row: &SignalRow) -> PublishOutcome {
        info!(
            signal = %row.signal,
            id = %row.id,
            payload = %row.payload,
            "signal flushed"
        );
        PublishOutcome::Confirmed
    }
}
