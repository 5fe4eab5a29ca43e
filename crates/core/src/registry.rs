//! Explicit registration of signal types.
//!
//! The registry is populated during process startup and then handed to the
//! flush engine; there is no implicit scanning of loaded types.

use std::collections::HashMap;
use std::sync::Arc;

use crate::descriptor::SignalDescriptor;
use crate::error::{SignalError, SignalResult};
use crate::sender::SignalSender;

/// A registered signal type: its configuration plus its send capability.
#[derive(Clone)]
pub struct RegisteredSignal {
    pub descriptor: SignalDescriptor,
    pub sender: Arc<dyn SignalSender>,
}

impl std::fmt::Debug for RegisteredSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredSignal")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// All signal types known to this process, in registration order.
#[derive(Debug, Default)]
pub struct SignalRegistry {
    by_name: HashMap<String, usize>,
    signals: Vec<RegisteredSignal>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a signal type. Names must be unique.
    pub fn register(
        &mut self,
        descriptor: SignalDescriptor,
        sender: Arc<dyn SignalSender>,
    ) -> SignalResult<()> {
        if self.by_name.contains_key(&descriptor.name) {
            return Err(SignalError::AlreadyRegistered(descriptor.name));
        }
        self.by_name
            .insert(descriptor.name.clone(), self.signals.len());
        self.signals.push(RegisteredSignal { descriptor, sender });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredSignal> {
        self.by_name.get(name).map(|&i| &self.signals[i])
    }

    /// Look up a type, failing with `UnknownSignal` when absent.
    pub fn require(&self, name: &str) -> SignalResult<&RegisteredSignal> {
        self.get(name)
            .ok_or_else(|| SignalError::unknown_signal(name))
    }

    /// All registered types, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredSignal> {
        self.signals.iter()
    }

    /// Names of all registered types, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.signals
            .iter()
            .map(|s| s.descriptor.name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}
