//! Process-local cache of rendered feeds.
//!
//! An entry is served only while it is younger than its TTL **and** its stored
//! ETag equals the one the caller computed from the current episode set.
//! Failing either check evicts the entry and reports a miss, so content
//! changes heal themselves on the next read; only the TTL window needs active
//! invalidation.
//!
//! Every public method takes the entry lock once, does its read-modify-write
//! and releases it before returning. Nothing here awaits, so concurrent
//! request tasks and the sweeper cannot interleave inside an update.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use castline_core::{Clock, SystemClock};

use super::options::{CacheKey, ETag};
use super::stats::{CacheHealth, CacheStats, StatsCounters};
use super::CacheDegradedError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedCacheConfig {
    pub ttl: Duration,
    pub max_entry_bytes: usize,
    pub max_entries: usize,
    pub sweep_interval: Duration,
}

impl Default for FeedCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entry_bytes: 5 * 1024 * 1024,
            max_entries: 256,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl FeedCacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_entry_bytes(mut self, bytes: usize) -> Self {
        self.max_entry_bytes = bytes;
        self
    }

    pub fn with_max_entries(mut self, entries: usize) -> Self {
        self.max_entries = entries;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// One rendered feed variant.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedCacheEntry {
    pub key: CacheKey,
    pub content: Arc<str>,
    pub etag: ETag,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub size_bytes: usize,
    pub episode_count: usize,
    /// Size before compression, when the stored content is compressed.
    pub uncompressed_bytes: Option<usize>,
}

impl FeedCacheEntry {
    pub fn new(
        key: CacheKey,
        content: impl Into<Arc<str>>,
        etag: ETag,
        episode_count: usize,
        created_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let content = content.into();
        Self {
            key,
            size_bytes: content.len(),
            content,
            etag,
            created_at,
            ttl_secs: ttl.as_secs(),
            episode_count,
            uncompressed_bytes: None,
        }
    }

    pub fn with_uncompressed_bytes(mut self, bytes: usize) -> Self {
        self.uncompressed_bytes = Some(bytes);
        self
    }

    /// `now - created_at >= ttl`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age_ms = (now - self.created_at).num_milliseconds();
        age_ms >= (self.ttl_secs as i64).saturating_mul(1000)
    }
}

#[derive(Debug)]
struct Slot {
    entry: FeedCacheEntry,
    /// Set by lazy invalidation; cleared by the next read whose ETag still matches.
    suspect: bool,
}

/// In-memory, TTL- and ETag-checked feed cache.
#[derive(Debug)]
pub struct FeedCache {
    config: FeedCacheConfig,
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<CacheKey, Slot>>,
    counters: Mutex<StatsCounters>,
}

impl FeedCache {
    pub fn new(config: FeedCacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: FeedCacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            slots: Mutex::new(HashMap::new()),
            counters: Mutex::new(StatsCounters::default()),
        }
    }

    pub fn config(&self) -> &FeedCacheConfig {
        &self.config
    }

    /// Build an entry stamped with the current time and the configured TTL.
    pub fn entry(
        &self,
        key: CacheKey,
        content: impl Into<Arc<str>>,
        etag: ETag,
        episode_count: usize,
    ) -> FeedCacheEntry {
        FeedCacheEntry::new(key, content, etag, episode_count, self.clock.now(), self.config.ttl)
    }

    /// Look up `key`, serving it only if it is within TTL and `fresh_etag`
    /// matches. Stale or mismatched entries are evicted.
    pub fn get(&self, key: &CacheKey, fresh_etag: &ETag) -> Option<FeedCacheEntry> {
        let now = self.clock.now();

        let outcome = {
            let mut slots = self.lock_slots();
            match slots.get_mut(key) {
                None => Lookup::Absent,
                Some(slot) if slot.entry.is_expired(now) => {
                    slots.remove(key);
                    Lookup::Expired
                }
                Some(slot) if slot.entry.etag != *fresh_etag => {
                    let suspect = slot.suspect;
                    slots.remove(key);
                    Lookup::Mismatch { suspect }
                }
                Some(slot) => {
                    let was_suspect = std::mem::replace(&mut slot.suspect, false);
                    Lookup::Hit {
                        entry: slot.entry.clone(),
                        was_suspect,
                    }
                }
            }
        };

        let mut counters = self.lock_counters();
        match outcome {
            Lookup::Hit { entry, was_suspect } => {
                counters.hits += 1;
                counters.bytes_served += entry.size_bytes as u64;
                if was_suspect {
                    debug!(key = %key, "suspect entry verified by etag, kept");
                }
                Some(entry)
            }
            Lookup::Absent => {
                counters.misses += 1;
                None
            }
            Lookup::Expired => {
                counters.misses += 1;
                counters.evictions += 1;
                debug!(key = %key, "entry expired on read, evicted");
                None
            }
            Lookup::Mismatch { suspect } => {
                counters.misses += 1;
                counters.evictions += 1;
                debug!(key = %key, suspect, "etag mismatch on read, evicted");
                None
            }
        }
    }

    /// Store `entry` under `key`.
    ///
    /// Oversized entries are logged and skipped; the caller just keeps
    /// regenerating. When full, the oldest entries make room.
    pub fn put(&self, key: CacheKey, entry: FeedCacheEntry) {
        if entry.size_bytes > self.config.max_entry_bytes {
            let err = CacheDegradedError::EntryTooLarge {
                key: key.to_string(),
                size: entry.size_bytes,
                limit: self.config.max_entry_bytes,
            };
            warn!(error = %err, "feed cache write skipped");
            self.lock_counters().rejected_writes += 1;
            return;
        }
        if self.config.max_entries == 0 {
            return;
        }

        let size = entry.size_bytes;
        let uncompressed = entry.uncompressed_bytes;

        let evicted = {
            let mut slots = self.lock_slots();
            let mut evicted = 0u64;
            if !slots.contains_key(&key) {
                while slots.len() >= self.config.max_entries {
                    let Some(oldest) = slots
                        .iter()
                        .min_by_key(|(_, s)| s.entry.created_at)
                        .map(|(k, _)| k.clone())
                    else {
                        break;
                    };
                    slots.remove(&oldest);
                    evicted += 1;
                }
            }
            slots.insert(key.clone(), Slot { entry, suspect: false });
            evicted
        };

        let mut counters = self.lock_counters();
        counters.bytes_served += size as u64;
        counters.evictions += evicted;
        if let Some(raw) = uncompressed {
            counters.record_compression(size, raw);
        }
        if evicted > 0 {
            debug!(key = %key, evicted, "cache full, oldest entries evicted");
        }
    }

    /// Remove every entry whose key starts with `prefix`; returns how many.
    pub fn invalidate(&self, prefix: &str) -> usize {
        let removed = {
            let mut slots = self.lock_slots();
            let before = slots.len();
            slots.retain(|k, _| !k.has_prefix(prefix));
            before - slots.len()
        };

        self.lock_counters().record_invalidation(self.clock.now());
        info!(prefix, removed, "feed cache invalidated");
        removed
    }

    /// Flag every entry under `prefix` as suspect without removing it.
    pub fn mark_suspect(&self, prefix: &str) -> usize {
        let marked = {
            let mut slots = self.lock_slots();
            let mut marked = 0;
            for (_, slot) in slots.iter_mut().filter(|(k, _)| k.has_prefix(prefix)) {
                slot.suspect = true;
                marked += 1;
            }
            marked
        };

        self.lock_counters().record_invalidation(self.clock.now());
        debug!(prefix, marked, "feed cache entries marked suspect");
        marked
    }

    pub fn is_suspect(&self, key: &CacheKey) -> bool {
        self.lock_slots().get(key).is_some_and(|s| s.suspect)
    }

    /// Drop every TTL-expired entry; returns how many.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let removed = {
            let mut slots = self.lock_slots();
            let before = slots.len();
            slots.retain(|_, s| !s.entry.is_expired(now));
            before - slots.len()
        };

        if removed > 0 {
            self.lock_counters().evictions += removed as u64;
            debug!(removed, "expired feed cache entries swept");
        }
        removed
    }

    /// Drop all entries and reset statistics.
    pub fn clear(&self) {
        self.lock_slots().clear();
        *self.lock_counters() = StatsCounters::default();
        info!("feed cache cleared");
    }

    /// Feed one end-to-end response time into the running average.
    pub fn record_response_time(&self, elapsed: Duration) {
        self.lock_counters().record_response(elapsed);
    }

    pub fn len(&self) -> usize {
        self.lock_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, total_bytes) = {
            let slots = self.lock_slots();
            (slots.len(), slots.values().map(|s| s.entry.size_bytes).sum())
        };
        self.lock_counters()
            .snapshot(entries, self.config.max_entries, total_bytes)
    }

    pub fn health(&self) -> CacheHealth {
        self.stats().health(self.clock.now())
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| {
            warn!(error = %CacheDegradedError::LockPoisoned("entries"), "recovering feed cache");
            PoisonError::into_inner(poisoned)
        })
    }

    fn lock_counters(&self) -> MutexGuard<'_, StatsCounters> {
        self.counters.lock().unwrap_or_else(|poisoned| {
            warn!(error = %CacheDegradedError::LockPoisoned("stats"), "recovering feed cache");
            PoisonError::into_inner(poisoned)
        })
    }
}

enum Lookup {
    Absent,
    Expired,
    Mismatch { suspect: bool },
    Hit { entry: FeedCacheEntry, was_suspect: bool },
}

#[cfg(test)]
mod tests {
    use castline_core::{FeedId, ManualClock};

    use super::*;
    use crate::feed::options::RenderOptions;

    fn setup(config: FeedCacheConfig) -> (FeedCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (FeedCache::with_clock(config, clock.clone()), clock)
    }

    fn key(feed: &str, limit: usize) -> CacheKey {
        CacheKey::derive(&FeedId::parse(feed).unwrap(), &RenderOptions::default().with_limit(limit))
    }

    fn etag(s: &str) -> ETag {
        ETag::compute(&[], &RenderOptions::default().with_limit(s.len().max(1)))
    }

    #[test]
    fn put_then_get_within_ttl_hits_and_misses_after_ttl() {
        let (cache, clock) = setup(FeedCacheConfig::default().with_ttl(Duration::from_secs(60)));
        let k = key("main", 10);
        let entry = cache.entry(k.clone(), "<rss/>", etag("a"), 0);
        cache.put(k.clone(), entry.clone());

        let hit = cache.get(&k, &entry.etag).expect("hit within ttl");
        assert_eq!(&*hit.content, "<rss/>");

        clock.advance(chrono::Duration::seconds(60));
        assert!(cache.get(&k, &entry.etag).is_none());
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.evictions), (1, 1, 1));
    }

    #[test]
    fn etag_mismatch_evicts_before_ttl() {
        let (cache, _) = setup(FeedCacheConfig::default());
        let k = key("main", 10);
        cache.put(k.clone(), cache.entry(k.clone(), "<rss/>", etag("a"), 0));

        assert!(cache.get(&k, &etag("bb")).is_none());
        assert!(cache.get(&k, &etag("a")).is_none(), "entry is gone after mismatch");
    }

    #[test]
    fn oversized_entries_are_skipped_not_errors() {
        let (cache, _) = setup(FeedCacheConfig::default().with_max_entry_bytes(4));
        let k = key("main", 10);
        cache.put(k.clone(), cache.entry(k.clone(), "too large", etag("a"), 0));

        assert!(cache.get(&k, &etag("a")).is_none());
        assert_eq!(cache.stats().rejected_writes, 1);
    }

    #[test]
    fn full_cache_evicts_oldest_first() {
        let (cache, clock) = setup(FeedCacheConfig::default().with_max_entries(2));
        let (k1, k2, k3) = (key("main", 1), key("main", 2), key("main", 3));

        cache.put(k1.clone(), cache.entry(k1.clone(), "1", etag("a"), 0));
        clock.advance(chrono::Duration::seconds(1));
        cache.put(k2.clone(), cache.entry(k2.clone(), "2", etag("a"), 0));
        clock.advance(chrono::Duration::seconds(1));
        cache.put(k3.clone(), cache.entry(k3.clone(), "3", etag("a"), 0));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&k1, &etag("a")).is_none());
        assert!(cache.get(&k3, &etag("a")).is_some());
    }

    #[test]
    fn invalidate_only_touches_the_prefix() {
        let (cache, _) = setup(FeedCacheConfig::default());
        let (a1, a2, b1) = (key("alpha", 1), key("alpha", 2), key("beta", 1));
        for k in [&a1, &a2, &b1] {
            cache.put(k.clone(), cache.entry(k.clone(), "x", etag("a"), 0));
        }

        let prefix = CacheKey::feed_prefix(&FeedId::parse("alpha").unwrap());
        assert_eq!(cache.invalidate(&prefix), 2);
        assert!(cache.get(&b1, &etag("a")).is_some());

        let stats = cache.stats();
        assert_eq!(stats.invalidations, 1);
        assert!(stats.last_invalidation_at.is_some());
    }

    #[test]
    fn suspect_flag_clears_when_etag_still_matches() {
        let (cache, _) = setup(FeedCacheConfig::default());
        let k = key("main", 10);
        cache.put(k.clone(), cache.entry(k.clone(), "x", etag("a"), 0));

        assert_eq!(cache.mark_suspect("feed:main:"), 1);
        assert!(cache.is_suspect(&k));

        assert!(cache.get(&k, &etag("a")).is_some());
        assert!(!cache.is_suspect(&k));
    }

    #[test]
    fn suspect_entry_with_new_etag_is_evicted() {
        let (cache, _) = setup(FeedCacheConfig::default());
        let k = key("main", 10);
        cache.put(k.clone(), cache.entry(k.clone(), "x", etag("a"), 0));
        cache.mark_suspect("feed:main:");

        assert!(cache.get(&k, &etag("bb")).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let (cache, clock) = setup(FeedCacheConfig::default().with_ttl(Duration::from_secs(10)));
        let (old, young) = (key("main", 1), key("main", 2));
        cache.put(old.clone(), cache.entry(old.clone(), "old", etag("a"), 0));
        clock.advance(chrono::Duration::seconds(6));
        cache.put(young.clone(), cache.entry(young.clone(), "young", etag("a"), 0));
        clock.advance(chrono::Duration::seconds(5));

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&young, &etag("a")).is_some());
    }

    #[test]
    fn stats_track_bytes_and_compression_and_reset_on_clear() {
        let (cache, _) = setup(FeedCacheConfig::default());
        let k = key("main", 10);
        let entry = cache
            .entry(k.clone(), "0123456789", etag("a"), 3)
            .with_uncompressed_bytes(40);
        cache.put(k.clone(), entry);
        cache.get(&k, &etag("a"));
        cache.record_response_time(Duration::from_millis(8));

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_bytes, 10);
        assert_eq!(stats.bytes_served, 20);
        assert_eq!(stats.avg_compression_ratio, Some(4.0));
        assert!((stats.hit_rate - 1.0).abs() < f64::EPSILON);

        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats, CacheStats { max_entries: 256, ..CacheStats::default() });
    }
}
