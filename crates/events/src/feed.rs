use castline_core::FeedId;

use crate::event::PipelineEvent;

/// Helper trait for feed-scoped messages.
///
/// Workers can be pinned to a single feed so that a process serving one feed
/// ignores invalidation traffic meant for another.
pub trait FeedScoped {
    fn feed_id(&self) -> &FeedId;
}

impl FeedScoped for PipelineEvent {
    fn feed_id(&self) -> &FeedId {
        PipelineEvent::feed_id(self)
    }
}
