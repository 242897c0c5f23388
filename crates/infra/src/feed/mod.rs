//! Feed rendering and the cache in front of it.

pub mod cache;
pub mod options;
pub mod render;
pub mod stats;

pub use cache::{FeedCache, FeedCacheConfig, FeedCacheEntry};
pub use options::{CacheKey, ETag, RenderOptions, SortOrder};
pub use render::{FeedMeta, FeedRenderer, RssRenderer};
pub use stats::{CacheHealth, CacheStats};

/// Things that go wrong inside the cache.
///
/// Only ever logged. A degraded cache behaves like a miss and the feed is
/// regenerated from the episode source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheDegradedError {
    #[error("entry {key} is {size} bytes, over the {limit} byte limit")]
    EntryTooLarge {
        key: String,
        size: usize,
        limit: usize,
    },
    #[error("{0} lock was poisoned")]
    LockPoisoned(&'static str),
}
