//! Wire-level types exchanged with the broker.

use signalbus_core::MessageId;

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    /// Routing key deciding which queue(s) receive the message.
    pub routing_key: String,
    pub body: Vec<u8>,
    /// Persistent messages survive a broker restart.
    pub persistent: bool,
}

impl Message {
    pub fn new(routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            id: MessageId::new(),
            routing_key: routing_key.into(),
            body,
            persistent: true,
        }
    }

    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }
}

/// Broker acknowledgment for published messages, keyed by delivery tag.
///
/// With `multiple` set, the confirmation covers every outstanding tag up
/// to and including `delivery_tag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack { delivery_tag: u64, multiple: bool },
    Nack { delivery_tag: u64, multiple: bool },
}

/// One message handed to a consumer, awaiting settlement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub message: Message,
}

/// How a consumer settles a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove from the queue.
    Ack,
    /// Not processed. With `requeue`, the message goes back to the queue
    /// for redelivery; without, it is dropped (or dead-lettered by the
    /// broker).
    Nack { requeue: bool },
}
