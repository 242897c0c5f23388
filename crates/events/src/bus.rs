//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes pipeline events to in-process consumers (the cache
//! invalidation coordinator, mostly). It is deliberately lightweight:
//!
//! - **Transport-agnostic**: the in-memory broadcast bus is the only shipped
//!   implementation, but nothing here assumes it.
//! - **Best-effort delivery**: a slow subscriber may lag and lose messages.
//!   Consumers must tolerate that; the feed cache recovers through its ETag
//!   check and TTL regardless.
//! - **No persistence**: the durable stores are the source of truth.

use std::sync::Arc;

use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// A subscription to an event stream.
///
/// Each subscription gets its own copy of every message published after it was
/// created (broadcast semantics).
///
/// ```ignore
/// let mut sub = bus.subscribe();
/// loop {
///     match sub.recv().await {
///         Ok(event) => handle(event).await,
///         Err(RecvError::Lagged(n)) => warn!(skipped = n, "subscriber lagged"),
///         Err(RecvError::Closed) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: broadcast::Receiver<M>,
}

impl<M: Clone> Subscription<M> {
    pub fn new(receiver: broadcast::Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Result<M, RecvError> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// ```text
/// JobRunner ──publish──> EventBus ──> InvalidationWorker ──> InvalidationCoordinator
/// ```
///
/// `publish()` never blocks on consumers. Publishing with no subscribers is
/// not an error; the message is simply dropped.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    /// Publish a message, returning how many subscribers it was delivered to.
    fn publish(&self, message: M) -> Result<usize, Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<usize, Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
