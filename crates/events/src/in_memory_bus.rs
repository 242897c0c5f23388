//! In-memory event bus.

use std::convert::Infallible;

use tokio::sync::broadcast;

use crate::bus::{EventBus, Subscription};

/// Default per-subscriber buffer before a slow consumer starts lagging.
pub const DEFAULT_CAPACITY: usize = 1024;

/// In-memory pub/sub bus backed by a tokio broadcast channel.
///
/// - Best-effort fan-out
/// - Bounded per-subscriber buffer (lagging subscribers lose the oldest messages)
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    sender: broadcast::Sender<M>,
}

impl<M: Clone> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<M: Clone> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + Sync + 'static,
{
    type Error = Infallible;

    fn publish(&self, message: M) -> Result<usize, Self::Error> {
        if self.sender.receiver_count() == 0 {
            return Ok(0);
        }
        // A send error only means every receiver dropped between the count and the send.
        Ok(self.sender.send(message).unwrap_or(0))
    }

    fn subscribe(&self) -> Subscription<M> {
        Subscription::new(self.sender.subscribe())
    }
}
