//! Retrying executor for transactional units of work.
//!
//! Database serialization failures and deadlocks are transient: the unit of
//! work is re-run in a fresh transaction until it succeeds or the attempt
//! budget is exhausted. Every other error propagates immediately.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{FlushError, FlushResult};
use crate::store::{OutboxStore, OutboxTx};

/// How often and how patiently conflicted transactions are re-run.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Backoff before the second retry; doubles for each retry after that.
    pub min_backoff: Duration,
    /// Upper bound on the backoff.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given number of failures. The first retry is
    /// immediate; later retries back off exponentially up to the cap.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures <= 1 {
            return Duration::ZERO;
        }
        let doubled = self
            .min_backoff
            .saturating_mul(2u32.saturating_pow(failures - 2));
        doubled.min(self.max_backoff)
    }
}

/// One transactional unit of work, re-runnable on conflict.
///
/// `run` must be side-effect free outside the transaction, except for
/// message sends: a conflicted commit after a confirmed send produces a
/// duplicate delivery, which consumers are expected to tolerate.
#[async_trait]
pub trait UnitOfWork<Tx: Send>: Send {
    type Output: Send;

    async fn run(&mut self, tx: &mut Tx) -> FlushResult<Self::Output>;
}

/// Run `work` in a fresh transaction, retrying on serialization conflicts
/// according to `policy`.
pub async fn with_retry<S, W>(
    store: &S,
    policy: &RetryPolicy,
    work: &mut W,
) -> FlushResult<W::Output>
where
    S: OutboxStore,
    W: UnitOfWork<S::Tx>,
{
    let mut failures = 0u32;
    loop {
        let mut tx = store.begin().await?;
        let conflict = match work.run(&mut tx).await {
            Ok(output) => match tx.commit().await {
                Ok(()) => return Ok(output),
                Err(e) if e.is_serialization() => FlushError::from(e),
                Err(e) => return Err(e.into()),
            },
            Err(e) => {
                let _ = tx.rollback().await;
                if !e.is_conflict() {
                    return Err(e);
                }
                e
            }
        };

        failures += 1;
        if failures >= policy.max_attempts {
            return Err(FlushError::DbSerialization { attempts: failures });
        }
        debug!(failures, error = %conflict, "transaction conflict, retrying");
        let backoff = policy.backoff(failures);
        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::memory::InMemoryOutboxStore;

    struct Conflicting {
        conflicts_left: u32,
        attempts: u32,
    }

    #[async_trait]
    impl<Tx: Send> UnitOfWork<Tx> for Conflicting {
        type Output = u32;

        async fn run(&mut self, _tx: &mut Tx) -> FlushResult<u32> {
            self.attempts += 1;
            if self.conflicts_left > 0 {
                self.conflicts_left -= 1;
                return Err(StoreError::Serialization("deadlock detected".into()).into());
            }
            Ok(self.attempts)
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn first_success_runs_exactly_once() {
        let store = InMemoryOutboxStore::new();
        let mut work = Conflicting {
            conflicts_left: 0,
            attempts: 0,
        };
        let attempts = with_retry(&store, &fast_policy(5), &mut work).await.unwrap();
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn conflicts_are_retried_until_success() {
        let store = InMemoryOutboxStore::new();
        let mut work = Conflicting {
            conflicts_left: 3,
            attempts: 0,
        };
        let attempts = with_retry(&store, &fast_policy(5), &mut work).await.unwrap();
        assert_eq!(attempts, 4);
    }

    #[tokio::test]
    async fn exhaustion_reports_the_attempt_count() {
        let store = InMemoryOutboxStore::new();
        let mut work = Conflicting {
            conflicts_left: u32::MAX,
            attempts: 0,
        };
        let err = with_retry(&store, &fast_policy(4), &mut work)
            .await
            .unwrap_err();
        assert!(matches!(err, FlushError::DbSerialization { attempts: 4 }));
        assert_eq!(work.attempts, 4);
    }

    #[tokio::test]
    async fn non_conflict_errors_propagate_immediately() {
        let store = InMemoryOutboxStore::new();

        struct Broken {
            attempts: u32,
        }

        #[async_trait]
        impl<Tx: Send> UnitOfWork<Tx> for Broken {
            type Output = ();

            async fn run(&mut self, _tx: &mut Tx) -> FlushResult<()> {
                self.attempts += 1;
                Err(StoreError::storage("delete", "relation does not exist").into())
            }
        }

        let mut work = Broken { attempts: 0 };
        let err = with_retry(&store, &fast_policy(5), &mut work)
            .await
            .unwrap_err();
        assert!(matches!(err, FlushError::Store(_)));
        assert_eq!(work.attempts, 1);
    }

    #[tokio::test]
    async fn commit_conflicts_are_retried_too() {
        let store = InMemoryOutboxStore::new();
        store.inject_commit_conflicts(2);
        let mut work = Conflicting {
            conflicts_left: 0,
            attempts: 0,
        };
        let attempts = with_retry(&store, &fast_policy(5), &mut work).await.unwrap();
        assert_eq!(attempts, 3);
    }

    #[test]
    fn backoff_schedule_is_capped_exponential() {
        let policy = RetryPolicy {
            max_attempts: 10,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::ZERO);
        assert_eq!(policy.backoff(2), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(200));
        assert_eq!(policy.backoff(5), Duration::from_millis(800));
        assert_eq!(policy.backoff(6), Duration::from_secs(1));
        assert_eq!(policy.backoff(12), Duration::from_secs(1));
    }
}
