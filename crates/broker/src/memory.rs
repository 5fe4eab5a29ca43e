//! In-memory broker for tests.
//!
//! Implements the channel ports over shared queues. Confirmation behavior
//! is scriptable per published message, so publisher failure paths
//! (nacks, slow confirms, dying channels) can be exercised without a real
//! broker.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::connection::{BrokerConnection, ConsumeChannel, PublishChannel};
use crate::error::{BrokerError, BrokerResult};
use crate::message::{Confirmation, Delivery, Disposition, Message};

/// What the broker does with the next published message.
#[derive(Debug, Clone, Copy)]
pub enum ConfirmAction {
    /// Acknowledge this message alone.
    Ack,
    /// Acknowledge this and every earlier outstanding message at once.
    AckMultiple,
    /// Refuse the message.
    Nack,
    /// Acknowledge after a delay (to exercise confirm timeouts).
    DelayedAck(Duration),
    /// Fail the confirmation stream (channel died).
    Fail,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<Message>,
    next_tag: u64,
    unsettled: HashMap<u64, Message>,
    max_outstanding: usize,
}

#[derive(Default)]
struct BrokerInner {
    queues: HashMap<String, QueueState>,
    confirm_script: VecDeque<ConfirmAction>,
    fail_publishes: u32,
}

impl BrokerInner {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the broker's reaction to upcoming publishes; unscripted
    /// messages are acknowledged.
    pub fn script_confirms(&self, actions: impl IntoIterator<Item = ConfirmAction>) {
        self.lock().confirm_script.extend(actions);
    }

    /// Make the next `n` publish calls fail at send time.
    pub fn fail_next_publishes(&self, n: u32) {
        self.lock().fail_publishes = n;
    }

    /// Enqueue a message directly, as an external producer would.
    pub fn push(&self, queue: &str, message: Message) {
        self.lock().queue(queue).messages.push_back(message);
        self.notify.notify_waiters();
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queue(queue).messages.len()
    }

    /// Highest number of simultaneously unsettled deliveries seen on a
    /// queue. Never exceeds the consumer's prefetch window.
    pub fn max_outstanding(&self, queue: &str) -> usize {
        self.lock().queue(queue).max_outstanding
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BrokerConnection for InMemoryBroker {
    type Publisher = InMemoryPublishChannel;
    type Consumer = InMemoryConsumeChannel;

    async fn open_publisher(&self) -> BrokerResult<InMemoryPublishChannel> {
        Ok(InMemoryPublishChannel {
            broker: self.clone(),
            next_tag: 0,
            staged: VecDeque::new(),
        })
    }

    async fn open_consumer(&self, queue: &str, prefetch: u16) -> BrokerResult<InMemoryConsumeChannel> {
        Ok(InMemoryConsumeChannel {
            broker: self.clone(),
            queue: queue.to_string(),
            prefetch: prefetch.max(1) as usize,
        })
    }
}

pub struct InMemoryPublishChannel {
    broker: InMemoryBroker,
    next_tag: u64,
    staged: VecDeque<(u64, ConfirmAction, Message)>,
}

#[async_trait]
impl PublishChannel for InMemoryPublishChannel {
    async fn publish(&mut self, message: &Message) -> BrokerResult<u64> {
        let action = {
            let mut inner = self.broker.lock();
            if inner.fail_publishes > 0 {
                inner.fail_publishes -= 1;
                return Err(BrokerError::Connection("socket reset".into()));
            }
            inner.confirm_script.pop_front().unwrap_or(ConfirmAction::Ack)
        };
        self.next_tag += 1;
        self.staged.push_back((self.next_tag, action, message.clone()));
        Ok(self.next_tag)
    }

    async fn next_confirmation(&mut self) -> BrokerResult<Confirmation> {
        let Some((tag, action, message)) = self.staged.pop_front() else {
            return Err(BrokerError::ChannelClosed);
        };
        match action {
            ConfirmAction::Ack => {
                self.deliver(message);
                Ok(Confirmation::Ack {
                    delivery_tag: tag,
                    multiple: false,
                })
            }
            ConfirmAction::AckMultiple => {
                self.deliver(message);
                let mut last = tag;
                while let Some((tag, _, message)) = self.staged.pop_front() {
                    self.deliver(message);
                    last = tag;
                }
                Ok(Confirmation::Ack {
                    delivery_tag: last,
                    multiple: true,
                })
            }
            ConfirmAction::Nack => Ok(Confirmation::Nack {
                delivery_tag: tag,
                multiple: false,
            }),
            ConfirmAction::DelayedAck(delay) => {
                tokio::time::sleep(delay).await;
                self.deliver(message);
                Ok(Confirmation::Ack {
                    delivery_tag: tag,
                    multiple: false,
                })
            }
            ConfirmAction::Fail => Err(BrokerError::Connection("channel died".into())),
        }
    }
}

impl InMemoryPublishChannel {
    fn deliver(&self, message: Message) {
        let queue = message.routing_key.clone();
        self.broker.push(&queue, message);
    }
}

pub struct InMemoryConsumeChannel {
    broker: InMemoryBroker,
    queue: String,
    prefetch: usize,
}

#[async_trait]
impl ConsumeChannel for InMemoryConsumeChannel {
    async fn next_delivery(&mut self) -> BrokerResult<Option<Delivery>> {
        loop {
            let notified = self.broker.notify.notified();
            {
                let mut inner = self.broker.lock();
                let queue = inner.queue(&self.queue);
                if queue.unsettled.len() < self.prefetch {
                    if let Some(message) = queue.messages.pop_front() {
                        queue.next_tag += 1;
                        let tag = queue.next_tag;
                        queue.unsettled.insert(tag, message.clone());
                        queue.max_outstanding = queue.max_outstanding.max(queue.unsettled.len());
                        return Ok(Some(Delivery { tag, message }));
                    }
                }
            }
            notified.await;
        }
    }

    async fn settle(&mut self, tag: u64, disposition: Disposition) -> BrokerResult<()> {
        let mut inner = self.broker.lock();
        let queue = inner.queue(&self.queue);
        if let Some(message) = queue.unsettled.remove(&tag) {
            if let Disposition::Nack { requeue: true } = disposition {
                queue.messages.push_front(message);
            }
        }
        drop(inner);
        self.broker.notify.notify_waiters();
        Ok(())
    }
}
