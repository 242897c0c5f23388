use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::handle::WorkerHandle;
use crate::feed::FeedCache;
use crate::invalidation::InvalidationCoordinator;

/// Run `tick` every `period` until stopped. The first run happens one
/// `period` after spawning.
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> WorkerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    let period = period.max(Duration::from_millis(1));

    let join = tokio::spawn(async move {
        info!(worker = name, period_ms = period.as_millis() as u64, "periodic worker started");

        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = signal.notified() => {
                    debug!(worker = name, "periodic worker received shutdown signal");
                    break;
                }
                _ = interval.tick() => tick().await,
            }
        }
    });

    WorkerHandle::new(name, shutdown, join)
}

/// Proactively drop TTL-expired feed cache entries.
pub fn spawn_cache_sweeper(cache: Arc<FeedCache>) -> WorkerHandle {
    let period = cache.config().sweep_interval;
    spawn_periodic("feed-cache-sweeper", period, move || {
        cache.sweep_expired();
        std::future::ready(())
    })
}

/// Periodically apply queued invalidations (scheduled strategy).
pub fn spawn_drain_ticker(coordinator: Arc<InvalidationCoordinator>, period: Duration) -> WorkerHandle {
    spawn_periodic("invalidation-drain", period, move || {
        let coordinator = coordinator.clone();
        async move {
            coordinator.drain().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use castline_core::ManualClock;

    use super::*;
    use crate::feed::{CacheKey, ETag, FeedCacheConfig, RenderOptions};

    #[tokio::test(start_paused = true)]
    async fn ticks_on_period_and_stops_on_request() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let handle = spawn_periodic("test", Duration::from_secs(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_aborts_the_task() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let handle = spawn_periodic("test", Duration::from_secs(1), move || {
            c.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        });
        drop(handle);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_removes_expired_entries() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = FeedCacheConfig::default()
            .with_ttl(Duration::from_secs(30))
            .with_sweep_interval(Duration::from_secs(60));
        let cache = Arc::new(FeedCache::with_clock(config, clock.clone()));

        let opts = RenderOptions::default();
        let key = CacheKey::derive(&castline_core::FeedId::parse("main").unwrap(), &opts);
        cache.put(key.clone(), cache.entry(key, "<rss/>", ETag::compute(&[], &opts), 0));

        let handle = spawn_cache_sweeper(cache.clone());
        clock.advance(chrono::Duration::seconds(31));
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(cache.is_empty());
        handle.stop().await;
    }
}
