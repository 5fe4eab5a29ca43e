//! `signalbus-core` — domain foundation for the signal bus.
//!
//! This crate contains **pure domain** primitives (no infrastructure
//! concerns): strongly-typed identifiers, the signal row, the per-type
//! descriptor, the publish outcome, the sender capability trait, and the
//! explicit signal registry.

pub mod descriptor;
pub mod error;
pub mod id;
pub mod outcome;
pub mod registry;
pub mod row;
pub mod sender;

pub use descriptor::SignalDescriptor;
pub use error::{SignalError, SignalResult};
pub use id::{MessageId, SignalId};
pub use outcome::PublishOutcome;
pub use registry::{RegisteredSignal, SignalRegistry};
pub use row::{NewSignal, SignalRow};
pub use sender::SignalSender;
