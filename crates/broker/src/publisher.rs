//! Confirm-mode publisher.
//!
//! Messages are pipelined onto the channel, then the publisher waits for
//! the broker's confirmations. A batch succeeds only as a whole; on any
//! failure the channel is discarded and reopened lazily on the next call,
//! so stale confirmations from an abandoned batch can never be
//! misattributed.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use signalbus_core::{PublishOutcome, SignalRow, SignalSender};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::{BrokerConnection, PublishChannel};
use crate::message::{Confirmation, Message};

const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(20);

pub struct ReliablePublisher<C: BrokerConnection> {
    connection: C,
    channel: Option<C::Publisher>,
    confirm_timeout: Duration,
}

impl<C: BrokerConnection> ReliablePublisher<C> {
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            channel: None,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Publish a batch and wait until the broker has confirmed every
    /// message, the deadline passes, or something fails.
    ///
    /// Never returns `Confirmed` unless all messages were acknowledged.
    pub async fn publish_batch(&mut self, messages: &[Message]) -> PublishOutcome {
        if messages.is_empty() {
            return PublishOutcome::Confirmed;
        }

        let mut channel = match self.channel.take() {
            Some(channel) => channel,
            None => match self.connection.open_publisher().await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(error = %e, "could not open publish channel");
                    return PublishOutcome::ConnectionLost;
                }
            },
        };

        let mut outstanding = BTreeSet::new();
        for message in messages {
            match channel.publish(message).await {
                Ok(tag) => {
                    outstanding.insert(tag);
                }
                Err(e) => {
                    warn!(error = %e, "publish failed mid-batch");
                    return PublishOutcome::ConnectionLost;
                }
            }
        }

        let deadline = Instant::now() + self.confirm_timeout;
        while !outstanding.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return PublishOutcome::TimedOut;
            }
            let confirmation =
                match tokio::time::timeout(remaining, channel.next_confirmation()).await {
                    Err(_elapsed) => return PublishOutcome::TimedOut,
                    Ok(Err(e)) => {
                        warn!(error = %e, "confirmation stream failed");
                        return PublishOutcome::ConnectionLost;
                    }
                    Ok(Ok(confirmation)) => confirmation,
                };
            match confirmation {
                Confirmation::Ack {
                    delivery_tag,
                    multiple,
                } => {
                    settle(&mut outstanding, delivery_tag, multiple);
                }
                Confirmation::Nack { delivery_tag, .. } => {
                    return PublishOutcome::rejected(format!(
                        "broker refused delivery tag {delivery_tag}"
                    ));
                }
            }
        }

        debug!(count = messages.len(), "batch confirmed");
        self.channel = Some(channel);
        PublishOutcome::Confirmed
    }
}

fn settle(outstanding: &mut BTreeSet<u64>, delivery_tag: u64, multiple: bool) {
    if multiple {
        *outstanding = outstanding.split_off(&(delivery_tag + 1));
    } else {
        outstanding.remove(&delivery_tag);
    }
}

/// [`SignalSender`] backed by a [`ReliablePublisher`].
///
/// Rows are serialized as JSON and routed by their signal type name
/// unless a fixed routing key is set.
pub struct PublisherSender<C: BrokerConnection> {
    publisher: Mutex<ReliablePublisher<C>>,
    routing_key: Option<String>,
}

impl<C: BrokerConnection> PublisherSender<C> {
    pub fn new(publisher: ReliablePublisher<C>) -> Self {
        Self {
            publisher: Mutex::new(publisher),
            routing_key: None,
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    fn message_for(&self, row: &SignalRow) -> Option<Message> {
        let body = serde_json::to_vec(&row.payload).ok()?;
        let routing_key = self
            .routing_key
            .clone()
            .unwrap_or_else(|| row.signal.clone());
        Some(Message::new(routing_key, body))
    }
}

#[async_trait]
impl<C: BrokerConnection> SignalSender for PublisherSender<C> {
    async fn send_one(&self, row: &SignalRow) -> PublishOutcome {
        self.send_many(std::slice::from_ref(row)).await
    }

    async fn send_many(&self, rows: &[SignalRow]) -> PublishOutcome {
        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            match self.message_for(row) {
                Some(message) => messages.push(message),
                None => {
                    return PublishOutcome::rejected(format!(
                        "signal {} has an unserializable payload",
                        row.id
                    ));
                }
            }
        }
        self.publisher.lock().await.publish_batch(&messages).await
    }
}
