//! Channel ports a broker client must provide.
//!
//! The publisher and consumer are written against these traits; `memory`
//! implements them for tests. A production AMQP binding implements them
//! over its channel objects.

use async_trait::async_trait;

use crate::error::BrokerResult;
use crate::message::{Confirmation, Delivery, Disposition, Message};

/// A connection that can open publish and consume channels.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    type Publisher: PublishChannel;
    type Consumer: ConsumeChannel;

    /// Open a channel in confirm mode.
    async fn open_publisher(&self) -> BrokerResult<Self::Publisher>;

    /// Open a consuming channel on a queue with the given prefetch
    /// window: at most `prefetch` deliveries may be outstanding
    /// (delivered but unsettled) at any time.
    async fn open_consumer(&self, queue: &str, prefetch: u16) -> BrokerResult<Self::Consumer>;
}

/// A confirm-mode channel. Publishes are pipelined; confirmations arrive
/// asynchronously and are consumed in broker order.
#[async_trait]
pub trait PublishChannel: Send {
    /// Send a message without waiting for its confirmation. Returns the
    /// delivery tag the broker will confirm under.
    async fn publish(&mut self, message: &Message) -> BrokerResult<u64>;

    /// Receive the next confirmation from the broker.
    async fn next_confirmation(&mut self) -> BrokerResult<Confirmation>;
}

/// A consuming channel.
#[async_trait]
pub trait ConsumeChannel: Send {
    /// Receive the next delivery, waiting for one to arrive. Returns
    /// `None` when the broker cancelled the consumer.
    async fn next_delivery(&mut self) -> BrokerResult<Option<Delivery>>;

    /// Settle a previously received delivery, freeing one slot of the
    /// prefetch window.
    async fn settle(&mut self, tag: u64, disposition: Disposition) -> BrokerResult<()>;
}
