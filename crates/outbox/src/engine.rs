//! The flush engine: sends pending rows over their registered senders and
//! deletes them in the same transaction.
//!
//! Three strategies are offered. `flush` locks small non-blocking bursts
//! and is safe to run concurrently. `flushmany` works through a large
//! backlog in chunks and tolerates (but wastes effort under) concurrent
//! flushers. `flushordered` serializes on the head of the ordered stream
//! and delivers strictly by order key.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use signalbus_core::{RegisteredSignal, SignalError, SignalId, SignalRegistry, SignalRow};
use tracing::{debug, info, instrument, warn};

use crate::atomic::{RetryPolicy, UnitOfWork, with_retry};
use crate::error::{FlushError, FlushResult};
use crate::store::{OutboxStore, OutboxTx};

/// Rows examined per repository pass in `flushmany`.
const FLUSHMANY_CHUNK: usize = 1000;

/// Result of one flush invocation.
///
/// A failing type does not abort the invocation; its error is recorded
/// here and the remaining types are still flushed.
#[derive(Debug, Default)]
pub struct FlushSummary {
    /// Rows confirmed sent and deleted.
    pub sent: u64,
    /// Types that could not be fully flushed.
    pub failures: Vec<SignalFailure>,
}

impl FlushSummary {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug)]
pub struct SignalFailure {
    pub signal: String,
    pub error: FlushError,
}

/// Pending-row count for one registered type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReport {
    pub signal: String,
    pub table: String,
    pub pending: u64,
}

pub struct FlushEngine<S> {
    store: S,
    registry: Arc<SignalRegistry>,
    policy: RetryPolicy,
    auto_flush_enabled: AtomicBool,
}

impl<S: OutboxStore> FlushEngine<S> {
    pub fn new(store: S, registry: Arc<SignalRegistry>) -> Self {
        Self {
            store,
            registry,
            policy: RetryPolicy::default(),
            auto_flush_enabled: AtomicBool::new(true),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &SignalRegistry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Globally enable or disable `auto_flush`. Useful in tests that seed
    /// many rows and flush them in one go afterwards.
    pub fn set_auto_flush_enabled(&self, enabled: bool) {
        self.auto_flush_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn auto_flush_enabled(&self) -> bool {
        self.auto_flush_enabled.load(Ordering::Relaxed)
    }

    /// Flush the given types (all registered types when `None`) in small
    /// burst transactions.
    ///
    /// With `wait`, and only when nothing is pending up front, blocks up
    /// to the grace period for new rows to arrive before draining.
    #[instrument(skip_all)]
    pub async fn flush(
        &self,
        signals: Option<&[&str]>,
        wait: Option<Duration>,
    ) -> FlushResult<FlushSummary> {
        let selected = self.resolve(signals)?;
        if let Some(grace) = wait {
            let mut pending = 0u64;
            for reg in &selected {
                pending += self.store.pending_count(&reg.descriptor).await?;
            }
            if pending == 0 {
                debug!(grace_secs = grace.as_secs_f64(), "nothing pending, waiting");
                self.store.wait_for_pending(grace).await?;
            }
        }
        self.drain(&selected, Strategy::Burst).await
    }

    /// Work through a large backlog: snapshot pending ids in chunks and
    /// flush each chunk in burst-sized transactions.
    #[instrument(skip_all)]
    pub async fn flushmany(&self, signals: Option<&[&str]>) -> FlushResult<FlushSummary> {
        let selected = self.resolve(signals)?;
        self.drain(&selected, Strategy::Chunked).await
    }

    /// Flush ordered types strictly by order key. Every selected type must
    /// declare an order key.
    #[instrument(skip_all)]
    pub async fn flushordered(&self, signals: Option<&[&str]>) -> FlushResult<FlushSummary> {
        let selected = self.resolve(signals)?;
        for reg in &selected {
            if !reg.descriptor.is_ordered() {
                return Err(SignalError::NotOrdered(reg.descriptor.name.clone()).into());
            }
        }
        self.drain(&selected, Strategy::Ordered).await
    }

    /// Immediate flush after a producing transaction commits.
    ///
    /// Skips types whose descriptor opts out of auto-flush, and does
    /// nothing when auto-flush is disabled globally.
    pub async fn auto_flush(&self, signals: &[&str]) -> FlushResult<FlushSummary> {
        if !self.auto_flush_enabled() {
            return Ok(FlushSummary::default());
        }
        let selected: Vec<&RegisteredSignal> = self
            .resolve(Some(signals))?
            .into_iter()
            .filter(|reg| reg.descriptor.auto_flush)
            .collect();
        self.drain(&selected, Strategy::Burst).await
    }

    /// Pending-row counts for every registered type.
    pub async fn pending(&self) -> FlushResult<Vec<PendingReport>> {
        let mut out = Vec::with_capacity(self.registry.len());
        for reg in self.registry.iter() {
            let pending = self.store.pending_count(&reg.descriptor).await?;
            out.push(PendingReport {
                signal: reg.descriptor.name.clone(),
                table: reg.descriptor.table.clone(),
                pending,
            });
        }
        Ok(out)
    }

    fn resolve(&self, signals: Option<&[&str]>) -> FlushResult<Vec<&RegisteredSignal>> {
        match signals {
            None => Ok(self.registry.iter().collect()),
            Some(names) => names
                .iter()
                .map(|name| self.registry.require(name).map_err(FlushError::from))
                .collect(),
        }
    }

    async fn drain(
        &self,
        selected: &[&RegisteredSignal],
        strategy: Strategy,
    ) -> FlushResult<FlushSummary> {
        let mut summary = FlushSummary::default();
        for reg in selected {
            let name = reg.descriptor.name.as_str();
            info!(signal = name, "flushing");
            let result = match strategy {
                Strategy::Burst => self.flush_signal(reg).await,
                Strategy::Chunked => self.flushmany_signal(reg).await,
                Strategy::Ordered => self.flushordered_signal(reg).await,
            };
            match result {
                Ok(sent) => {
                    debug!(signal = name, sent, "flushed");
                    summary.sent += sent;
                }
                // Configuration errors mean the invocation itself is
                // wrong; do not swallow them into the summary.
                Err(e @ FlushError::Signal(_)) => return Err(e),
                Err(e) => {
                    warn!(signal = name, error = %e, "flush failed, rows stay pending");
                    summary.failures.push(SignalFailure {
                        signal: name.to_string(),
                        error: e,
                    });
                }
            }
        }
        Ok(summary)
    }

    /// Burst loop for one type; stops when a transaction finds no
    /// lockable pending rows.
    async fn flush_signal(&self, reg: &RegisteredSignal) -> FlushResult<u64> {
        let mut sent = 0u64;
        loop {
            let mut pass = BurstPass { reg };
            let n = with_retry(&self.store, &self.policy, &mut pass).await?;
            if n == 0 {
                return Ok(sent);
            }
            sent += n;
        }
    }

    async fn flushmany_signal(&self, reg: &RegisteredSignal) -> FlushResult<u64> {
        let burst = reg.descriptor.burst_count.get() as usize;
        let mut sent = 0u64;
        loop {
            let ids = self
                .store
                .pending_ids(&reg.descriptor, FLUSHMANY_CHUNK)
                .await?;
            if ids.is_empty() {
                return Ok(sent);
            }
            let snapshot = ids.len();
            let mut chunk_sent = 0u64;
            for batch in ids.chunks(burst) {
                let mut pass = IdBatchPass {
                    reg,
                    ids: batch.to_vec(),
                };
                chunk_sent += with_retry(&self.store, &self.policy, &mut pass).await?;
            }
            sent += chunk_sent;
            // A short snapshot means the backlog is drained. A chunk that
            // sent nothing means every row was locked by concurrent
            // flushers; leave the rest to them.
            if snapshot < FLUSHMANY_CHUNK || chunk_sent == 0 {
                return Ok(sent);
            }
        }
    }

    async fn flushordered_signal(&self, reg: &RegisteredSignal) -> FlushResult<u64> {
        let mut sent = 0u64;
        loop {
            let mut pass = OrderedPass { reg };
            let n = with_retry(&self.store, &self.policy, &mut pass).await?;
            if n == 0 {
                return Ok(sent);
            }
            sent += n;
        }
    }
}

#[derive(Clone, Copy)]
enum Strategy {
    Burst,
    Chunked,
    Ordered,
}

/// Lock a burst of pending rows, send, delete.
struct BurstPass<'a> {
    reg: &'a RegisteredSignal,
}

#[async_trait]
impl<Tx: OutboxTx> UnitOfWork<Tx> for BurstPass<'_> {
    type Output = u64;

    async fn run(&mut self, tx: &mut Tx) -> FlushResult<u64> {
        let rows = tx
            .lock_pending(&self.reg.descriptor, self.reg.descriptor.burst_count.get())
            .await?;
        deliver_and_delete(tx, self.reg, rows).await
    }
}

/// Lock a previously snapshotted batch of ids, send, delete. Rows the
/// snapshot saw but that are meanwhile gone (or locked) are skipped.
struct IdBatchPass<'a> {
    reg: &'a RegisteredSignal,
    ids: Vec<SignalId>,
}

#[async_trait]
impl<Tx: OutboxTx> UnitOfWork<Tx> for IdBatchPass<'_> {
    type Output = u64;

    async fn run(&mut self, tx: &mut Tx) -> FlushResult<u64> {
        let rows = tx.lock_ids(&self.reg.descriptor, &self.ids).await?;
        deliver_and_delete(tx, self.reg, rows).await
    }
}

/// Lock the head of the ordered stream, send, delete.
struct OrderedPass<'a> {
    reg: &'a RegisteredSignal,
}

#[async_trait]
impl<Tx: OutboxTx> UnitOfWork<Tx> for OrderedPass<'_> {
    type Output = u64;

    async fn run(&mut self, tx: &mut Tx) -> FlushResult<u64> {
        let rows = tx
            .lock_ordered(&self.reg.descriptor, self.reg.descriptor.burst_count.get())
            .await?;
        deliver_and_delete(tx, self.reg, rows).await
    }
}

/// Send a locked batch and delete it. Anything other than a confirmed
/// batch rolls the transaction back, leaving every row pending.
async fn deliver_and_delete<Tx: OutboxTx>(
    tx: &mut Tx,
    reg: &RegisteredSignal,
    rows: Vec<SignalRow>,
) -> FlushResult<u64> {
    if rows.is_empty() {
        return Ok(0);
    }
    let outcome = reg.sender.send_many(&rows).await;
    if !outcome.is_confirmed() {
        return Err(FlushError::NotConfirmed(outcome));
    }
    let ids: Vec<SignalId> = rows.iter().map(|r| r.id).collect();
    tx.delete(&reg.descriptor, &ids).await?;
    Ok(rows.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryOutboxStore;
    use signalbus_core::{NewSignal, PublishOutcome, SignalDescriptor, SignalSender};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Records batch sizes and payloads; outcomes can be scripted per
    /// batch (defaults to `Confirmed`).
    #[derive(Default)]
    struct ScriptedSender {
        outcomes: Mutex<VecDeque<PublishOutcome>>,
        batches: Mutex<Vec<usize>>,
        payloads: Mutex<Vec<serde_json::Value>>,
    }

    impl ScriptedSender {
        fn script(&self, outcomes: impl IntoIterator<Item = PublishOutcome>) {
            self.outcomes.lock().unwrap().extend(outcomes);
        }

        fn batches(&self) -> Vec<usize> {
            self.batches.lock().unwrap().clone()
        }

        fn payloads(&self) -> Vec<serde_json::Value> {
            self.payloads.lock().unwrap().clone()
        }

        fn rows_sent(&self) -> usize {
            self.batches().iter().sum()
        }
    }

    #[async_trait]
    impl SignalSender for ScriptedSender {
        async fn send_one(&self, row: &SignalRow) -> PublishOutcome {
            self.send_many(std::slice::from_ref(row)).await
        }

        async fn send_many(&self, rows: &[SignalRow]) -> PublishOutcome {
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(PublishOutcome::Confirmed);
            if outcome.is_confirmed() {
                self.batches.lock().unwrap().push(rows.len());
                self.payloads
                    .lock()
                    .unwrap()
                    .extend(rows.iter().map(|r| r.payload.clone()));
            }
            outcome
        }
    }

    struct Fixture {
        engine: FlushEngine<InMemoryOutboxStore>,
        sender: Arc<ScriptedSender>,
        descriptor: SignalDescriptor,
    }

    fn fixture(descriptor: SignalDescriptor) -> Fixture {
        let sender = Arc::new(ScriptedSender::default());
        let mut registry = SignalRegistry::new();
        registry
            .register(descriptor.clone(), Arc::clone(&sender) as Arc<dyn SignalSender>)
            .unwrap();
        let engine = FlushEngine::new(InMemoryOutboxStore::new(), Arc::new(registry))
            .with_policy(RetryPolicy {
                max_attempts: 5,
                min_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            });
        Fixture {
            engine,
            sender,
            descriptor,
        }
    }

    async fn seed(f: &Fixture, n: usize) {
        let signals = (0..n).map(|i| NewSignal::new(json!({ "n": i }))).collect();
        f.engine
            .store()
            .record(&f.descriptor, signals)
            .await
            .unwrap();
    }

    async fn pending(f: &Fixture) -> u64 {
        f.engine
            .store()
            .pending_count(&f.descriptor)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn five_rows_burst_two_take_three_transactions() {
        let f = fixture(SignalDescriptor::new("transfer").with_burst_count(2).unwrap());
        seed(&f, 5).await;

        let summary = f.engine.flush(None, None).await.unwrap();
        assert_eq!(summary.sent, 5);
        assert!(summary.is_complete());
        assert_eq!(f.sender.batches(), vec![2, 2, 1]);
        assert_eq!(pending(&f).await, 0);
    }

    #[tokio::test]
    async fn unconfirmed_batch_leaves_every_row_pending() {
        let f = fixture(SignalDescriptor::new("transfer").with_burst_count(3).unwrap());
        seed(&f, 3).await;
        f.sender.script([PublishOutcome::TimedOut]);

        let summary = f.engine.flush(None, None).await.unwrap();
        assert_eq!(summary.sent, 0);
        assert_eq!(summary.failures.len(), 1);
        assert!(matches!(
            summary.failures[0].error,
            FlushError::NotConfirmed(PublishOutcome::TimedOut)
        ));
        assert_eq!(pending(&f).await, 3);
    }

    #[tokio::test]
    async fn rejected_batch_is_rolled_back_whole() {
        let f = fixture(SignalDescriptor::new("transfer").with_burst_count(3).unwrap());
        seed(&f, 3).await;
        f.sender
            .script([PublishOutcome::rejected("mandatory message unroutable")]);

        let summary = f.engine.flush(None, None).await.unwrap();
        assert_eq!(summary.failures.len(), 1);
        // No partial deletes: the whole batch stays.
        assert_eq!(pending(&f).await, 3);

        // The next invocation (broker recovered) drains everything.
        let summary = f.engine.flush(None, None).await.unwrap();
        assert_eq!(summary.sent, 3);
        assert_eq!(pending(&f).await, 0);
    }

    #[tokio::test]
    async fn flushmany_drains_in_burst_sized_batches() {
        let f = fixture(SignalDescriptor::new("transfer").with_burst_count(2).unwrap());
        seed(&f, 5).await;

        let summary = f.engine.flushmany(None).await.unwrap();
        assert_eq!(summary.sent, 5);
        assert_eq!(f.sender.batches(), vec![2, 2, 1]);
        assert_eq!(pending(&f).await, 0);
    }

    #[tokio::test]
    async fn unknown_signal_aborts_the_invocation() {
        let f = fixture(SignalDescriptor::new("transfer"));
        let err = f.engine.flush(Some(&["imaginary"]), None).await.unwrap_err();
        assert!(matches!(
            err,
            FlushError::Signal(SignalError::UnknownSignal(_))
        ));
    }

    #[tokio::test]
    async fn flushordered_rejects_unordered_types() {
        let f = fixture(SignalDescriptor::new("transfer"));
        let err = f.engine.flushordered(None).await.unwrap_err();
        assert!(matches!(err, FlushError::Signal(SignalError::NotOrdered(_))));
    }

    #[tokio::test]
    async fn flushordered_delivers_by_ascending_position() {
        let f = fixture(
            SignalDescriptor::new("ledger_entry")
                .with_burst_count(2)
                .unwrap()
                .with_order_key(["position"]),
        );
        for pos in [3i64, 1, 2] {
            f.engine
                .store()
                .record(
                    &f.descriptor,
                    vec![NewSignal::new(json!({ "pos": pos })).at_position(pos)],
                )
                .await
                .unwrap();
        }

        let summary = f.engine.flushordered(None).await.unwrap();
        assert_eq!(summary.sent, 3);
        assert_eq!(
            f.sender.payloads(),
            vec![json!({ "pos": 1 }), json!({ "pos": 2 }), json!({ "pos": 3 })]
        );
        assert_eq!(pending(&f).await, 0);
    }

    #[tokio::test]
    async fn commit_conflict_resends_but_deletes_once() {
        let f = fixture(SignalDescriptor::new("transfer"));
        seed(&f, 1).await;
        f.engine.store().inject_commit_conflicts(1);

        let summary = f.engine.flush(None, None).await.unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(pending(&f).await, 0);
        // The first attempt sent and then failed to commit, so the row
        // went out twice. At-least-once, not exactly-once.
        assert_eq!(f.sender.rows_sent(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_flushers_partition_the_backlog() {
        let f = Arc::new(fixture(SignalDescriptor::new("transfer")));
        seed(&f, 6).await;

        let left = Arc::clone(&f);
        let right = Arc::clone(&f);
        let (left, right) = tokio::join!(
            tokio::spawn(async move { left.engine.flush(None, None).await }),
            tokio::spawn(async move { right.engine.flush(None, None).await }),
        );
        let left = left.unwrap().unwrap();
        let right = right.unwrap().unwrap();

        // Every row is delivered and deleted exactly once between the two.
        assert_eq!(left.sent + right.sent, 6);
        assert_eq!(f.sender.rows_sent(), 6);
        assert_eq!(pending(&f).await, 0);
    }

    #[tokio::test]
    async fn flushordered_resumes_at_the_stream_head_after_a_failed_commit() {
        let f = fixture(
            SignalDescriptor::new("ledger_entry")
                .with_burst_count(2)
                .unwrap()
                .with_order_key(["position"]),
        );
        for pos in [2i64, 4, 1, 3] {
            f.engine
                .store()
                .record(
                    &f.descriptor,
                    vec![NewSignal::new(json!(pos)).at_position(pos)],
                )
                .await
                .unwrap();
        }
        f.engine.store().inject_commit_conflicts(1);

        let summary = f.engine.flushordered(None).await.unwrap();
        assert_eq!(summary.sent, 4);
        assert_eq!(pending(&f).await, 0);
        // The failed head batch is repeated whole; delivery never skips
        // ahead of an undeleted row.
        assert_eq!(
            f.sender.payloads(),
            vec![json!(1), json!(2), json!(1), json!(2), json!(3), json!(4)]
        );
    }

    #[tokio::test]
    async fn auto_flush_can_be_disabled_globally() {
        let f = fixture(SignalDescriptor::new("transfer"));
        seed(&f, 2).await;

        f.engine.set_auto_flush_enabled(false);
        let summary = f.engine.auto_flush(&["transfer"]).await.unwrap();
        assert_eq!(summary.sent, 0);
        assert_eq!(pending(&f).await, 2);

        f.engine.set_auto_flush_enabled(true);
        let summary = f.engine.auto_flush(&["transfer"]).await.unwrap();
        assert_eq!(summary.sent, 2);
    }

    #[tokio::test]
    async fn auto_flush_skips_opted_out_types() {
        let f = fixture(SignalDescriptor::new("transfer").with_auto_flush(false));
        seed(&f, 2).await;

        let summary = f.engine.auto_flush(&["transfer"]).await.unwrap();
        assert_eq!(summary.sent, 0);
        assert_eq!(pending(&f).await, 2);

        // An explicit flush still drains them.
        let summary = f.engine.flush(None, None).await.unwrap();
        assert_eq!(summary.sent, 2);
    }

    #[tokio::test]
    async fn flush_with_wait_picks_up_rows_recorded_during_grace() {
        let f = Arc::new(fixture(SignalDescriptor::new("transfer")));
        let flusher = Arc::clone(&f);
        let handle = tokio::spawn(async move {
            flusher
                .engine
                .flush(None, Some(Duration::from_secs(5)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        seed(&f, 1).await;

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(pending(&f).await, 0);
    }

    #[tokio::test]
    async fn pending_reports_per_type_counts() {
        let sender = Arc::new(ScriptedSender::default());
        let mut registry = SignalRegistry::new();
        let transfer = SignalDescriptor::new("transfer");
        let ledger = SignalDescriptor::new("ledger_entry");
        for d in [&transfer, &ledger] {
            registry
                .register(d.clone(), Arc::clone(&sender) as Arc<dyn SignalSender>)
                .unwrap();
        }
        let engine = FlushEngine::new(InMemoryOutboxStore::new(), Arc::new(registry));
        engine
            .store()
            .record(&transfer, vec![NewSignal::new(json!({}))])
            .await
            .unwrap();

        let reports = engine.pending().await.unwrap();
        assert_eq!(
            reports,
            vec![
                PendingReport {
                    signal: "transfer".into(),
                    table: "transfer_signal".into(),
                    pending: 1,
                },
                PendingReport {
                    signal: "ledger_entry".into(),
                    table: "ledger_entry_signal".into(),
                    pending: 0,
                },
            ]
        );
    }
}
