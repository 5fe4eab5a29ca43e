//! In-memory outbox store for tests and examples.
//!
//! Mirrors the locking behavior of the Postgres adapter: row locks are
//! tracked per table, skip-locked reads never block, and the ordered head
//! lock waits for competing transactions to finish. Commit conflicts can be
//! injected to exercise the retry executor.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use signalbus_core::{SignalDescriptor, SignalId, SignalRow};
use tokio::sync::Notify;

use crate::error::{StoreError, StoreResult};
use crate::store::{OutboxStore, OutboxTx};

#[derive(Default)]
struct Table {
    rows: BTreeMap<SignalId, SignalRow>,
    locked: HashSet<SignalId>,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Table>,
    // Number of upcoming commits that should fail with a serialization
    // conflict, simulating REPEATABLE READ aborts at commit time.
    commit_conflicts: u32,
}

impl Inner {
    fn table(&mut self, name: &str) -> &mut Table {
        self.tables.entry(name.to_string()).or_default()
    }
}

/// Shared, clonable in-memory store.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a serialization conflict.
    pub fn inject_commit_conflicts(&self, n: u32) {
        self.lock().commit_conflicts = n;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> StoreResult<InMemoryTx> {
        Ok(InMemoryTx {
            inner: Arc::clone(&self.inner),
            notify: Arc::clone(&self.notify),
            locks: Vec::new(),
            deletes: Vec::new(),
            inserts: Vec::new(),
            finished: false,
        })
    }

    async fn pending_count(&self, signal: &SignalDescriptor) -> StoreResult<u64> {
        let mut inner = self.lock();
        Ok(inner.table(&signal.table).rows.len() as u64)
    }

    async fn pending_ids(
        &self,
        signal: &SignalDescriptor,
        limit: usize,
    ) -> StoreResult<Vec<SignalId>> {
        let mut inner = self.lock();
        Ok(inner
            .table(&signal.table)
            .rows
            .keys()
            .take(limit)
            .copied()
            .collect())
    }

    async fn wait_for_pending(&self, grace: Duration) -> StoreResult<bool> {
        Ok(tokio::time::timeout(grace, self.notify.notified())
            .await
            .is_ok())
    }
}

pub struct InMemoryTx {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    locks: Vec<(String, SignalId)>,
    deletes: Vec<(String, SignalId)>,
    inserts: Vec<(String, SignalRow)>,
    finished: bool,
}

impl InMemoryTx {
    fn release_locks(inner: &mut Inner, locks: &[(String, SignalId)]) {
        for (table, id) in locks {
            inner.table(table).locked.remove(id);
        }
    }

    fn finish(&mut self) {
        let locks = std::mem::take(&mut self.locks);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::release_locks(&mut inner, &locks);
        self.finished = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    fn ordered_head(table: &Table, limit: usize) -> Vec<SignalRow> {
        let mut rows: Vec<&SignalRow> = table.rows.values().collect();
        rows.sort_by_key(|r| (r.position, r.id));
        rows.into_iter().take(limit).cloned().collect()
    }
}

impl Drop for InMemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            self.finish();
        }
    }
}

#[async_trait]
impl OutboxTx for InMemoryTx {
    async fn insert(
        &mut self,
        signal: &SignalDescriptor,
        rows: Vec<SignalRow>,
    ) -> StoreResult<()> {
        for row in rows {
            self.inserts.push((signal.table.clone(), row));
        }
        Ok(())
    }

    async fn lock_pending(
        &mut self,
        signal: &SignalDescriptor,
        limit: u32,
    ) -> StoreResult<Vec<SignalRow>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let table = inner.table(&signal.table);
        let mut out = Vec::new();
        for (id, row) in &table.rows {
            if out.len() == limit as usize {
                break;
            }
            if !table.locked.contains(id) {
                out.push(row.clone());
            }
        }
        for row in &out {
            table.locked.insert(row.id);
            self.locks.push((signal.table.clone(), row.id));
        }
        Ok(out)
    }

    async fn lock_ids(
        &mut self,
        signal: &SignalDescriptor,
        ids: &[SignalId],
    ) -> StoreResult<Vec<SignalRow>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let table = inner.table(&signal.table);
        let mut out = Vec::new();
        for id in ids {
            // Rows deleted by a concurrent sender or locked elsewhere are
            // silently skipped.
            if table.locked.contains(id) {
                continue;
            }
            if let Some(row) = table.rows.get(id) {
                out.push(row.clone());
            }
        }
        for row in &out {
            table.locked.insert(row.id);
            self.locks.push((signal.table.clone(), row.id));
        }
        Ok(out)
    }

    async fn lock_ordered(
        &mut self,
        signal: &SignalDescriptor,
        limit: u32,
    ) -> StoreResult<Vec<SignalRow>> {
        // Rows carry the order key in the single `position` field, the same
        // restriction the Postgres schema imposes. Reject anything else
        // before taking locks.
        match signal.order_key.as_deref() {
            None => {}
            Some([column]) if column == "position" => {}
            Some(other) => {
                return Err(StoreError::storage(
                    "order_key",
                    format!("this store orders by the \"position\" column only, got {other:?}"),
                ));
            }
        }
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                let table = inner.table(&signal.table);
                let head = Self::ordered_head(table, limit as usize);
                if head.iter().all(|r| !table.locked.contains(&r.id)) {
                    for row in &head {
                        table.locked.insert(row.id);
                        self.locks.push((signal.table.clone(), row.id));
                    }
                    return Ok(head);
                }
            }
            // The stream head is held by another transaction; wait for a
            // commit or rollback and look again.
            notified.await;
        }
    }

    async fn delete(&mut self, signal: &SignalDescriptor, ids: &[SignalId]) -> StoreResult<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let table = inner.table(&signal.table);
        let mut deleted = 0;
        for id in ids {
            if table.rows.contains_key(id) {
                self.deletes.push((signal.table.clone(), *id));
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn commit(mut self) -> StoreResult<()> {
        let had_inserts = !self.inserts.is_empty();
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.commit_conflicts > 0 {
                inner.commit_conflicts -= 1;
                drop(inner);
                self.finish();
                return Err(StoreError::Serialization(
                    "could not serialize access due to concurrent update".into(),
                ));
            }
            let deletes = std::mem::take(&mut self.deletes);
            for (table, id) in deletes {
                inner.table(&table).rows.remove(&id);
            }
            let inserts = std::mem::take(&mut self.inserts);
            for (table, row) in inserts {
                inner.table(&table).rows.insert(row.id, row);
            }
        }
        self.finish();
        if had_inserts {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn rollback(mut self) -> StoreResult<()> {
        self.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signalbus_core::NewSignal;
    use serde_json::json;

    fn descriptor() -> SignalDescriptor {
        SignalDescriptor::new("transfer")
    }

    async fn seed(store: &InMemoryOutboxStore, n: usize) -> Vec<SignalId> {
        let signals = (0..n).map(|i| NewSignal::new(json!({ "n": i }))).collect();
        store.record(&descriptor(), signals).await.unwrap()
    }

    #[tokio::test]
    async fn locked_rows_are_skipped_by_other_transactions() {
        let store = InMemoryOutboxStore::new();
        seed(&store, 3).await;

        let mut first = store.begin().await.unwrap();
        let held = first.lock_pending(&descriptor(), 2).await.unwrap();
        assert_eq!(held.len(), 2);

        let mut second = store.begin().await.unwrap();
        let rest = second.lock_pending(&descriptor(), 10).await.unwrap();
        assert_eq!(rest.len(), 1);

        second.rollback().await.unwrap();
        first.rollback().await.unwrap();

        // All locks released.
        let mut third = store.begin().await.unwrap();
        assert_eq!(third.lock_pending(&descriptor(), 10).await.unwrap().len(), 3);
        third.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn delete_is_applied_at_commit() {
        let store = InMemoryOutboxStore::new();
        let ids = seed(&store, 2).await;

        let mut tx = store.begin().await.unwrap();
        tx.lock_ids(&descriptor(), &ids).await.unwrap();
        tx.delete(&descriptor(), &ids[..1]).await.unwrap();
        assert_eq!(store.pending_count(&descriptor()).await.unwrap(), 2);
        tx.commit().await.unwrap();
        assert_eq!(store.pending_count(&descriptor()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dropping_a_transaction_releases_its_locks() {
        let store = InMemoryOutboxStore::new();
        seed(&store, 1).await;

        {
            let mut tx = store.begin().await.unwrap();
            assert_eq!(tx.lock_pending(&descriptor(), 1).await.unwrap().len(), 1);
        }

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.lock_pending(&descriptor(), 1).await.unwrap().len(), 1);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn injected_commit_conflict_surfaces_as_serialization() {
        let store = InMemoryOutboxStore::new();
        seed(&store, 1).await;
        store.inject_commit_conflicts(1);

        let tx = store.begin().await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(err.is_serialization());

        // Only the first commit conflicts.
        let tx = store.begin().await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn unsupported_order_keys_are_rejected() {
        let store = InMemoryOutboxStore::new();
        let mismatched =
            SignalDescriptor::new("transfer").with_order_key(["creditor_id", "seqnum"]);

        let mut tx = store.begin().await.unwrap();
        let err = tx.lock_ordered(&mismatched, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Storage { .. }));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_pending_wakes_on_insert() {
        let store = InMemoryOutboxStore::new();
        let waiter = store.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for_pending(Duration::from_secs(5)).await
        });
        // Give the waiter a moment to register.
        tokio::time::sleep(Duration::from_millis(20)).await;
        seed(&store, 1).await;
        assert!(handle.await.unwrap().unwrap());
    }
}
