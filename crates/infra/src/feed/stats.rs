//! Cache statistics and health evaluation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Below this many requests the hit rate is too noisy to judge.
pub const HEALTH_MIN_REQUESTS: u64 = 100;
pub const HEALTH_MIN_HIT_RATE: f64 = 0.5;
pub const HEALTH_MAX_AVG_RESPONSE: Duration = Duration::from_millis(500);
pub const HEALTH_CAPACITY_WARN_RATIO: f64 = 0.9;
pub const HEALTH_STALE_INVALIDATION_HOURS: i64 = 24;

/// Point-in-time view of the cache, process-wide.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub avg_response_ms: f64,
    pub invalidations: u64,
    pub last_invalidation_at: Option<DateTime<Utc>>,
    pub evictions: u64,
    pub rejected_writes: u64,
    pub entries: usize,
    pub max_entries: usize,
    pub total_bytes: usize,
    pub bytes_served: u64,
    /// Mean of `uncompressed / stored` over writes that reported both sizes.
    pub avg_compression_ratio: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Mutable counters behind [`CacheStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub hits: u64,
    pub misses: u64,
    pub timed_responses: u64,
    pub avg_response_ms: f64,
    pub invalidations: u64,
    pub last_invalidation_at: Option<DateTime<Utc>>,
    pub evictions: u64,
    pub rejected_writes: u64,
    pub bytes_served: u64,
    compression_samples: u64,
    compression_ratio_sum: f64,
}

impl StatsCounters {
    pub fn record_response(&mut self, elapsed: Duration) {
        self.timed_responses += 1;
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_response_ms += (ms - self.avg_response_ms) / self.timed_responses as f64;
    }

    pub fn record_compression(&mut self, stored: usize, uncompressed: usize) {
        if stored == 0 {
            return;
        }
        self.compression_samples += 1;
        self.compression_ratio_sum += uncompressed as f64 / stored as f64;
    }

    pub fn record_invalidation(&mut self, at: DateTime<Utc>) {
        self.invalidations += 1;
        self.last_invalidation_at = Some(at);
    }

    pub fn snapshot(&self, entries: usize, max_entries: usize, total_bytes: usize) -> CacheStats {
        let total_requests = self.hits + self.misses;
        CacheStats {
            total_requests,
            hits: self.hits,
            misses: self.misses,
            hit_rate: if total_requests == 0 {
                0.0
            } else {
                self.hits as f64 / total_requests as f64
            },
            avg_response_ms: self.avg_response_ms,
            invalidations: self.invalidations,
            last_invalidation_at: self.last_invalidation_at,
            evictions: self.evictions,
            rejected_writes: self.rejected_writes,
            entries,
            max_entries,
            total_bytes,
            bytes_served: self.bytes_served,
            avg_compression_ratio: (self.compression_samples > 0)
                .then(|| self.compression_ratio_sum / self.compression_samples as f64),
        }
    }
}

impl CacheStats {
    pub fn health(&self, now: DateTime<Utc>) -> CacheHealth {
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        if self.total_requests >= HEALTH_MIN_REQUESTS && self.hit_rate < HEALTH_MIN_HIT_RATE {
            issues.push(format!("low hit rate: {:.1}%", self.hit_rate * 100.0));
            recommendations.push(
                "raise the cache TTL or check whether invalidations fire more often than content changes"
                    .to_string(),
            );
        }

        if self.avg_response_ms > HEALTH_MAX_AVG_RESPONSE.as_secs_f64() * 1000.0 {
            issues.push(format!("slow responses: {:.0}ms average", self.avg_response_ms));
            recommendations.push("lower the default episode limit or profile feed rendering".to_string());
        }

        if self.max_entries > 0
            && self.entries as f64 >= self.max_entries as f64 * HEALTH_CAPACITY_WARN_RATIO
        {
            issues.push(format!("cache near capacity: {}/{} entries", self.entries, self.max_entries));
            recommendations.push("raise the entry limit or shorten the TTL".to_string());
        }

        if let Some(at) = self.last_invalidation_at {
            if now - at > chrono::Duration::hours(HEALTH_STALE_INVALIDATION_HOURS) {
                issues.push(format!("no invalidation since {}", at.to_rfc3339()));
                recommendations
                    .push("verify the invalidation worker is running and subscribed".to_string());
            }
        }

        CacheHealth {
            healthy: issues.is_empty(),
            issues,
            recommendations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_average_response_time() {
        let mut c = StatsCounters::default();
        c.record_response(Duration::from_millis(10));
        c.record_response(Duration::from_millis(30));
        let s = c.snapshot(0, 10, 0);
        assert!((s.avg_response_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn compression_ratio_is_absent_until_reported() {
        let mut c = StatsCounters::default();
        assert_eq!(c.snapshot(0, 10, 0).avg_compression_ratio, None);
        c.record_compression(100, 400);
        c.record_compression(100, 200);
        assert_eq!(c.snapshot(0, 10, 0).avg_compression_ratio, Some(3.0));
    }

    #[test]
    fn empty_cache_is_healthy() {
        let health = CacheStats::default().health(Utc::now());
        assert!(health.healthy);
        assert!(health.issues.is_empty());
    }

    #[test]
    fn each_threshold_produces_issue_and_recommendation() {
        let now = Utc::now();
        let stats = CacheStats {
            total_requests: 200,
            hits: 20,
            misses: 180,
            hit_rate: 0.1,
            avg_response_ms: 900.0,
            entries: 95,
            max_entries: 100,
            last_invalidation_at: Some(now - chrono::Duration::hours(48)),
            ..CacheStats::default()
        };

        let health = stats.health(now);
        assert!(!health.healthy);
        assert_eq!(health.issues.len(), 4);
        assert_eq!(health.recommendations.len(), 4);
    }

    #[test]
    fn low_hit_rate_is_ignored_for_small_samples() {
        let stats = CacheStats {
            total_requests: 10,
            misses: 10,
            ..CacheStats::default()
        };
        assert!(stats.health(Utc::now()).healthy);
    }
}
