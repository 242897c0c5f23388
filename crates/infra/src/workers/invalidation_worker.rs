use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use castline_core::FeedId;
use castline_events::{EventBus, FeedScoped, PipelineEvent, RecvError};

use super::handle::WorkerHandle;
use crate::invalidation::InvalidationCoordinator;

/// Forwards pipeline events from the bus to the [`InvalidationCoordinator`].
///
/// - Subscribes at spawn time; events published earlier are not seen
/// - Optional feed filtering for processes serving a single feed
/// - A lagging subscription logs the gap and keeps going; skipped
///   invalidations are covered by the cache's ETag check and TTL
#[derive(Debug)]
pub struct InvalidationWorker;

impl InvalidationWorker {
    pub fn spawn<B>(
        bus: &B,
        coordinator: Arc<InvalidationCoordinator>,
        feed_id: Option<FeedId>,
    ) -> WorkerHandle
    where
        B: EventBus<PipelineEvent> + ?Sized,
    {
        const NAME: &str = "invalidation-worker";

        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();
        let mut sub = bus.subscribe();

        let join = tokio::spawn(async move {
            info!(worker = NAME, feed_id = ?feed_id, "invalidation worker started");
            loop {
                let event = tokio::select! {
                    _ = signal.notified() => break,
                    received = sub.recv() => received,
                };

                match event {
                    Ok(event) => {
                        let event_feed = FeedScoped::feed_id(&event);
                        if feed_id.as_ref().is_some_and(|f| event_feed != f) {
                            debug!(worker = NAME, event_feed = %event_feed, "ignoring event for another feed");
                            continue;
                        }
                        coordinator.handle_event(&event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(worker = NAME, skipped, "invalidation worker lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        WorkerHandle::new(NAME, shutdown, join)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use castline_core::{JobId, SubmissionId};
    use castline_events::{InMemoryEventBus, JobOutcome, JobTerminal};

    use super::*;
    use crate::feed::{FeedCache, FeedCacheConfig};
    use crate::invalidation::{InvalidationConfig, RecordingCdnClient};

    fn terminal(feed: &str) -> PipelineEvent {
        PipelineEvent::JobTerminal(JobTerminal {
            feed_id: FeedId::parse(feed).unwrap(),
            job_id: JobId::new(),
            submission_id: SubmissionId::new(),
            outcome: JobOutcome::Completed,
            error_message: None,
            occurred_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn forwards_matching_events_and_ignores_other_feeds() {
        let bus = Arc::new(InMemoryEventBus::<PipelineEvent>::new());
        let cdn = Arc::new(RecordingCdnClient::new());
        let cache = Arc::new(FeedCache::new(FeedCacheConfig::default()));
        let coordinator = Arc::new(InvalidationCoordinator::new(
            cache,
            cdn.clone(),
            InvalidationConfig::default(),
        ));

        let handle = InvalidationWorker::spawn(
            bus.as_ref(),
            coordinator.clone(),
            Some(FeedId::parse("main").unwrap()),
        );

        bus.publish(terminal("other")).unwrap();
        bus.publish(terminal("main")).unwrap();

        for _ in 0..100 {
            if cdn.call_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await;

        assert_eq!(cdn.call_count(), 1);
        let reports = coordinator.recent_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].feed_id.as_str(), "main");
    }
}
