//! Fan-out of produced items to every registered consumer.
//!
//! Each consumer gets its own unbounded channel, so a slow or failed consumer
//! never holds up delivery to the others. Items are shared via `Arc`.

use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

struct Consumer<T> {
    name: String,
    tx: UnboundedSender<Arc<T>>,
}

impl<T> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

/// Static fan-out to the consumers registered at startup.
pub struct Distributor<T> {
    consumers: Vec<Consumer<T>>,
}

impl<T> Distributor<T> {
    pub fn new() -> Self {
        Self {
            consumers: Vec::new(),
        }
    }

    /// Register a consumer and return its receiving end.
    pub fn register(&mut self, name: impl Into<String>) -> UnboundedReceiver<Arc<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.consumers.push(Consumer {
            name: name.into(),
            tx,
        });
        rx
    }

    /// Hand `item` to every consumer, in registration order.
    ///
    /// Returns how many consumers accepted it. A consumer whose receiver has
    /// gone away is skipped.
    pub fn deliver(&self, item: T) -> usize {
        let item = Arc::new(item);
        let mut delivered = 0;
        for consumer in &self.consumers {
            if consumer.tx.send(Arc::clone(&item)).is_ok() {
                delivered += 1;
            } else {
                tracing::debug!("Consumer {} is gone, dropping item", consumer.name);
            }
        }
        delivered
    }

    pub fn consumer_names(&self) -> impl Iterator<Item = &str> {
        self.consumers.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

impl<T> Clone for Distributor<T> {
    fn clone(&self) -> Self {
        Self {
            consumers: self.consumers.clone(),
        }
    }
}

impl<T> Default for Distributor<T> {
    fn default() -> Self {
        Self::new()
    }
}
