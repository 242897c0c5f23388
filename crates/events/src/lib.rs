//! Pipeline events and the in-process bus that carries them.

pub mod bus;
pub mod event;
pub mod feed;
pub mod in_memory_bus;

pub use bus::{EventBus, RecvError, Subscription, TryRecvError};
pub use event::{EpisodeChange, EpisodeChanged, Event, JobOutcome, JobTerminal, PipelineEvent};
pub use feed::FeedScoped;
pub use in_memory_bus::InMemoryEventBus;
