//! Topic based publish/subscribe seam between simulators.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use chain_proto::BusMessage;
use thiserror::Error;

pub type Handler = Arc<dyn Fn(BusMessage) + Send + Sync>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("subscriber registry lock poisoned")]
    Poisoned,
    #[error("bus is closed, dropped message for `{0}`")]
    Closed(String),
}

pub trait MessageBus: Send + Sync {
    fn subscribe(&self, topic: &str, handler: Handler) -> Result<(), BusError>;
    fn publish(&self, message: BusMessage) -> Result<(), BusError>;
    /// Refuse further publishes. Subscribers stay registered.
    fn close(&self);
}

/// Delivers each message synchronously to every handler of its topic, in
/// subscription order.
#[derive(Default)]
pub struct InMemoryBus {
    subscribers: RwLock<HashMap<String, Vec<Handler>>>,
    closed: AtomicBool,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .read()
            .map(|subscribers| subscribers.get(topic).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl MessageBus for InMemoryBus {
    fn subscribe(&self, topic: &str, handler: Handler) -> Result<(), BusError> {
        let mut subscribers = self.subscribers.write().map_err(|_| BusError::Poisoned)?;
        subscribers
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed(message.topic));
        }
        // handlers run outside the lock so they may publish themselves
        let handlers = {
            let subscribers = self.subscribers.read().map_err(|_| BusError::Poisoned)?;
            subscribers.get(&message.topic).cloned().unwrap_or_default()
        };
        if handlers.is_empty() {
            tracing::trace!(
                target: "chain_effect::bus",
                topic = %message.topic,
                "bus.publish.no_subscribers"
            );
        }
        for handler in handlers {
            handler(message.clone());
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(target: "chain_effect::bus", "bus.closed");
        }
    }
}
