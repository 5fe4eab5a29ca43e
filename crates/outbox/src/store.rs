//! Storage ports for the outbox.
//!
//! The flush engine talks to the database exclusively through these traits.
//! `memory` provides a test double; `postgres` is the production adapter.

use std::time::Duration;

use async_trait::async_trait;
use signalbus_core::{NewSignal, SignalDescriptor, SignalId, SignalRow};

use crate::error::StoreResult;

/// A handle onto the outbox tables of one database.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    type Tx: OutboxTx;

    /// Open a fresh transaction.
    async fn begin(&self) -> StoreResult<Self::Tx>;

    /// Number of rows currently pending for one type.
    async fn pending_count(&self, signal: &SignalDescriptor) -> StoreResult<u64>;

    /// Ids of up to `limit` pending rows, without locking them.
    async fn pending_ids(
        &self,
        signal: &SignalDescriptor,
        limit: usize,
    ) -> StoreResult<Vec<SignalId>>;

    /// Wait up to `grace` for a hint that new rows were recorded.
    ///
    /// Returns `true` when a hint arrived, `false` on timeout. Hints are
    /// advisory; a caller must still query for pending rows afterwards.
    async fn wait_for_pending(&self, grace: Duration) -> StoreResult<bool>;

    /// Record new signals in their own transaction and commit.
    ///
    /// Producers that already hold a transaction should insert through it
    /// instead, so the rows commit or roll back together with the change
    /// that caused them.
    async fn record(
        &self,
        signal: &SignalDescriptor,
        signals: Vec<NewSignal>,
    ) -> StoreResult<Vec<SignalId>> {
        let rows: Vec<SignalRow> = signals
            .into_iter()
            .map(|s| s.into_row(&signal.name))
            .collect();
        let ids = rows.iter().map(|r| r.id).collect();
        let mut tx = self.begin().await?;
        tx.insert(signal, rows).await?;
        tx.commit().await?;
        Ok(ids)
    }
}

/// One outbox transaction. Dropping an uncommitted transaction rolls it
/// back and releases every row lock it holds.
#[async_trait]
pub trait OutboxTx: Send {
    /// Insert rows; they become visible (and pending) at commit.
    async fn insert(&mut self, signal: &SignalDescriptor, rows: Vec<SignalRow>)
    -> StoreResult<()>;

    /// Lock up to `limit` pending rows, skipping rows already locked by
    /// other transactions. Never blocks.
    async fn lock_pending(
        &mut self,
        signal: &SignalDescriptor,
        limit: u32,
    ) -> StoreResult<Vec<SignalRow>>;

    /// Lock the given rows, skipping ones that are locked elsewhere or
    /// already deleted. Never blocks.
    async fn lock_ids(
        &mut self,
        signal: &SignalDescriptor,
        ids: &[SignalId],
    ) -> StoreResult<Vec<SignalRow>>;

    /// Lock the head of the ordered stream: the first `limit` rows in
    /// ascending order-key order. Blocks until the head rows are free, so
    /// concurrent ordered flushers serialize on the stream head.
    async fn lock_ordered(
        &mut self,
        signal: &SignalDescriptor,
        limit: u32,
    ) -> StoreResult<Vec<SignalRow>>;

    /// Delete rows by id, returning how many were deleted.
    async fn delete(&mut self, signal: &SignalDescriptor, ids: &[SignalId]) -> StoreResult<u64>;

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}
