//! The send capability a signal type must provide.

use async_trait::async_trait;

use crate::outcome::PublishOutcome;
use crate::row::SignalRow;

/// Capability interface for delivering recorded signals to the bus.
///
/// Implementations typically delegate to a confirmed publisher. The flush
/// engine deletes a row only after the sender reports `Confirmed` within
/// the same transaction, so a sender must not report `Confirmed` unless the
/// broker has durably accepted the message.
#[async_trait]
pub trait SignalSender: Send + Sync {
    /// Deliver a single row.
    async fn send_one(&self, row: &SignalRow) -> PublishOutcome;

    /// Deliver a batch of rows.
    ///
    /// The default implementation loops `send_one` and stops at the first
    /// unconfirmed outcome. Implementations that can pipeline a whole batch
    /// should override this; on return with `Confirmed` the broker must
    /// have accepted every message in the batch.
    async fn send_many(&self, rows: &[SignalRow]) -> PublishOutcome {
        for row in rows {
            let outcome = self.send_one(row).await;
            if !outcome.is_confirmed() {
                return outcome;
            }
        }
        PublishOutcome::Confirmed
    }
}
