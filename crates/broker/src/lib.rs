//! Broker-side plumbing: a confirm-mode publisher and a manual-ack
//! consumer, written against channel ports so any AMQP-style client (or
//! the in-memory test broker) can back them.

pub mod connection;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod message;
pub mod publisher;

pub use connection::{BrokerConnection, ConsumeChannel, PublishChannel};
pub use consumer::{Consumer, MessageHandler, StopHandle};
pub use error::{BrokerError, BrokerResult, TerminatedConsumption};
pub use memory::{ConfirmAction, InMemoryBroker};
pub use message::{Confirmation, Delivery, Disposition, Message};
pub use publisher::{PublisherSender, ReliablePublisher};
