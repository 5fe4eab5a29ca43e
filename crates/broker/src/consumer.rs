//! Queue consumer with manual acknowledgment and cooperative shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info, instrument};

use crate::connection::{BrokerConnection, ConsumeChannel};
use crate::error::{BrokerError, BrokerResult, TerminatedConsumption};
use crate::message::{Disposition, Message};

/// Application-side message processing.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Decide the fate of one message. Must settle every message it is
    /// given: either `Ack` or `Nack`.
    async fn handle(&self, message: &Message) -> Disposition;
}

/// Requests a clean stop of a running consumption loop. Clonable and
/// usable from signal handlers or other tasks; stopping is idempotent.
#[derive(Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// Consumes one queue until stopped or broken.
///
/// The prefetch window bounds how many deliveries may be in flight at
/// once, which is what provides backpressure against the broker.
pub struct Consumer<C: BrokerConnection> {
    connection: C,
    queue: String,
    prefetch: u16,
    stop: StopHandle,
}

impl<C: BrokerConnection> Consumer<C> {
    pub fn new(connection: C, queue: impl Into<String>) -> Self {
        Self {
            connection,
            queue: queue.into(),
            prefetch: 1,
            stop: StopHandle::new(),
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Handle for stopping the loop from another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run the consumption loop.
    ///
    /// Ends with `Ok(TerminatedConsumption)` when the stop handle fires,
    /// even mid-wait with an empty queue. Connection loss, timeouts and a
    /// broker-side cancel end the loop with an error; the caller decides
    /// whether to reconnect and run again.
    #[instrument(skip_all, fields(queue = %self.queue, prefetch = self.prefetch))]
    pub async fn run(&self, handler: &dyn MessageHandler) -> BrokerResult<TerminatedConsumption> {
        let mut channel = self
            .connection
            .open_consumer(&self.queue, self.prefetch)
            .await?;
        info!("consuming");
        loop {
            if self.stop.is_stopped() {
                info!("consumption stopped");
                return Ok(TerminatedConsumption);
            }
            tokio::select! {
                _ = self.stop.wait() => {
                    info!("consumption stopped");
                    return Ok(TerminatedConsumption);
                }
                next = channel.next_delivery() => {
                    let Some(delivery) = next? else {
                        return Err(BrokerError::ChannelClosed);
                    };
                    let disposition = handler.handle(&delivery.message).await;
                    debug!(tag = delivery.tag, ?disposition, "settling");
                    channel.settle(delivery.tag, disposition).await?;
                }
            }
        }
    }
}
