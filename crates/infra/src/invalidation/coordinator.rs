//! Keeps the feed cache coherent with job and episode changes.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use castline_core::{DomainError, FeedId};
use castline_events::{EpisodeChanged, Event, PipelineEvent};

use super::cdn::{CdnPurgeClient, PurgeRequest};
use crate::error::ServiceError;
use crate::feed::{CacheKey, FeedCache};
use crate::retry::{ExternalService, RetryConfig, RetryExecutor, RetryPolicy};

/// How many reports [`InvalidationCoordinator::recent_reports`] keeps.
const REPORT_HISTORY: usize = 64;

/// A scheduled invalidation waiting for the next drain: reason and source.
type Queued = (String, InvalidationSource);

/// When an invalidation triggered by an upstream change is actually applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationStrategy {
    /// Drop the feed's entries and purge the CDN before returning.
    #[default]
    Immediate,
    /// Queue the reason; a later [`drain`](InvalidationCoordinator::drain)
    /// applies one coalesced immediate invalidation per feed.
    Scheduled,
    /// Flag entries as suspect and let the next read's ETag check decide.
    Lazy,
}

impl core::fmt::Display for InvalidationStrategy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            InvalidationStrategy::Immediate => "immediate",
            InvalidationStrategy::Scheduled => "scheduled",
            InvalidationStrategy::Lazy => "lazy",
        })
    }
}

impl FromStr for InvalidationStrategy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(InvalidationStrategy::Immediate),
            "scheduled" => Ok(InvalidationStrategy::Scheduled),
            "lazy" => Ok(InvalidationStrategy::Lazy),
            other => Err(DomainError::validation(format!(
                "unknown invalidation strategy '{other}' (expected immediate, scheduled or lazy)"
            ))),
        }
    }
}

/// What prompted an invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvalidationSource {
    Manual,
    Event { event_type: &'static str },
    /// A drained batch: the source of every queued invalidation, in arrival order.
    Batch { event_types: Vec<&'static str> },
}

impl InvalidationSource {
    fn labels(&self) -> Vec<&'static str> {
        match self {
            InvalidationSource::Manual => vec!["manual"],
            InvalidationSource::Event { event_type } => vec![*event_type],
            InvalidationSource::Batch { event_types } => event_types.clone(),
        }
    }
}

impl core::fmt::Display for InvalidationSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            InvalidationSource::Manual => f.write_str("manual"),
            InvalidationSource::Event { event_type } => f.write_str(event_type),
            InvalidationSource::Batch { event_types } => {
                write!(f, "batch of {} ({})", event_types.len(), event_types.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CdnOutcome {
    NotRequested,
    Purged { purge_id: String },
    Failed { error: String },
}

/// One invalidation decision, for logs and callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub feed_id: FeedId,
    pub strategy: InvalidationStrategy,
    /// Keys removed (immediate, scheduled drain) or flagged (lazy).
    pub invalidated_keys: usize,
    pub reason: String,
    pub source: InvalidationSource,
    pub cdn: CdnOutcome,
    /// Queued for a later drain rather than applied.
    pub deferred: bool,
}

#[derive(Debug, Clone)]
pub struct InvalidationConfig {
    pub strategy: InvalidationStrategy,
    /// Public path prefix; a feed is served under `{base}/{feed_id}`.
    pub public_base_path: String,
    pub cdn_retry: RetryPolicy,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            strategy: InvalidationStrategy::Immediate,
            public_base_path: "/feeds".to_string(),
            cdn_retry: RetryPolicy::for_service(ExternalService::CdnPurge),
        }
    }
}

impl InvalidationConfig {
    pub fn with_strategy(mut self, strategy: InvalidationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_public_base_path(mut self, path: impl Into<String>) -> Self {
        self.public_base_path = path.into();
        self
    }

    pub fn with_cdn_retry(mut self, policy: RetryPolicy) -> Self {
        self.cdn_retry = policy;
        self
    }

    /// Public paths that serve `feed_id`.
    pub fn public_paths(&self, feed_id: &FeedId) -> Vec<String> {
        let base = self.public_base_path.trim_end_matches('/');
        vec![format!("{base}/{feed_id}"), format!("{base}/{feed_id}/*")]
    }
}

/// Decides when and how the [`FeedCache`] is invalidated and drives the CDN
/// purge collaborator.
///
/// One instance per process. Pending scheduled batches live in memory only;
/// call [`shutdown`](Self::shutdown) before exit to flush them.
pub struct InvalidationCoordinator {
    cache: Arc<FeedCache>,
    cdn: Arc<dyn CdnPurgeClient>,
    config: InvalidationConfig,
    cdn_retry: RetryConfig<ServiceError>,
    pending: Mutex<HashMap<FeedId, Vec<Queued>>>,
    reports: Mutex<VecDeque<InvalidationReport>>,
}

impl core::fmt::Debug for InvalidationCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InvalidationCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl InvalidationCoordinator {
    pub fn new(cache: Arc<FeedCache>, cdn: Arc<dyn CdnPurgeClient>, config: InvalidationConfig) -> Self {
        let cdn_retry = RetryConfig::new(config.cdn_retry.clone())
            .with_retry_condition(ServiceError::is_retryable)
            .on_retry(|attempt, err| warn!(attempt, error = %err, "retrying cdn purge"));
        Self {
            cache,
            cdn,
            config,
            cdn_retry,
            pending: Mutex::new(HashMap::new()),
            reports: Mutex::new(VecDeque::new()),
        }
    }

    pub fn strategy(&self) -> InvalidationStrategy {
        self.config.strategy
    }

    /// React to a pipeline event with the configured strategy.
    ///
    /// An episode change made by a job yields `None`: the job's own
    /// `JobTerminal` follows and invalidates once for the whole completion.
    pub async fn handle_event(&self, event: &PipelineEvent) -> Option<InvalidationReport> {
        if let PipelineEvent::EpisodeChanged(EpisodeChanged { job_id: Some(job_id), .. }) = event {
            debug!(feed_id = %event.feed_id(), job_id = %job_id, "episode change deferred to job terminal");
            return None;
        }
        let source = InvalidationSource::Event {
            event_type: event.event_type(),
        };
        Some(self.invalidate(event.feed_id(), event.describe(), source).await)
    }

    /// Apply the configured strategy to `feed_id`.
    pub async fn invalidate(
        &self,
        feed_id: &FeedId,
        reason: impl Into<String>,
        source: InvalidationSource,
    ) -> InvalidationReport {
        let reason = reason.into();
        match self.config.strategy {
            InvalidationStrategy::Immediate => self.invalidate_now(feed_id, reason, source).await,
            InvalidationStrategy::Scheduled => self.enqueue(feed_id, reason, source),
            InvalidationStrategy::Lazy => self.mark_suspect(feed_id, reason, source),
        }
    }

    /// Remove every cached entry of `feed_id`, then ask the CDN to purge.
    ///
    /// Returns once both have been attempted. A failed purge is logged and
    /// reported; the local entries are already gone either way.
    pub async fn invalidate_now(
        &self,
        feed_id: &FeedId,
        reason: impl Into<String>,
        source: InvalidationSource,
    ) -> InvalidationReport {
        let reason = reason.into();
        let removed = self.cache.invalidate(&CacheKey::feed_prefix(feed_id));

        let request = PurgeRequest {
            content_paths: self.config.public_paths(feed_id),
            reason: reason.clone(),
        };
        let executor = RetryExecutor::for_service(ExternalService::CdnPurge);
        let cdn = match executor
            .call(|| self.cdn.purge(request.clone()), &self.cdn_retry)
            .await
        {
            Ok(receipt) if receipt.success => CdnOutcome::Purged {
                purge_id: receipt.purge_id,
            },
            Ok(receipt) => {
                warn!(feed_id = %feed_id, purge_id = %receipt.purge_id, "cdn rejected purge");
                CdnOutcome::Failed {
                    error: format!("purge {} reported failure", receipt.purge_id),
                }
            }
            Err(err) => {
                warn!(feed_id = %feed_id, error = %err, "cdn purge failed, local cache already invalidated");
                CdnOutcome::Failed {
                    error: err.to_string(),
                }
            }
        };

        self.record(InvalidationReport {
            feed_id: feed_id.clone(),
            strategy: InvalidationStrategy::Immediate,
            invalidated_keys: removed,
            reason,
            source,
            cdn,
            deferred: false,
        })
    }

    fn enqueue(&self, feed_id: &FeedId, reason: String, source: InvalidationSource) -> InvalidationReport {
        let queued = {
            let mut pending = lock(&self.pending);
            let batch = pending.entry(feed_id.clone()).or_default();
            batch.push((reason.clone(), source.clone()));
            batch.len()
        };
        debug!(feed_id = %feed_id, queued, "invalidation queued for next drain");

        self.record(InvalidationReport {
            feed_id: feed_id.clone(),
            strategy: InvalidationStrategy::Scheduled,
            invalidated_keys: 0,
            reason,
            source,
            cdn: CdnOutcome::NotRequested,
            deferred: true,
        })
    }

    fn mark_suspect(&self, feed_id: &FeedId, reason: String, source: InvalidationSource) -> InvalidationReport {
        let marked = self.cache.mark_suspect(&CacheKey::feed_prefix(feed_id));
        info!(feed_id = %feed_id, marked, reason = %reason, "feed entries marked suspect");

        self.record(InvalidationReport {
            feed_id: feed_id.clone(),
            strategy: InvalidationStrategy::Lazy,
            invalidated_keys: marked,
            reason,
            source,
            cdn: CdnOutcome::NotRequested,
            deferred: false,
        })
    }

    /// Apply every queued batch: one immediate invalidation per feed.
    pub async fn drain(&self) -> Vec<InvalidationReport> {
        let batches: Vec<(FeedId, Vec<Queued>)> = lock(&self.pending).drain().collect();
        if batches.is_empty() {
            return Vec::new();
        }

        let mut reports = Vec::with_capacity(batches.len());
        for (feed_id, queued) in batches {
            let (reasons, sources): (Vec<String>, Vec<InvalidationSource>) = queued.into_iter().unzip();
            let source = InvalidationSource::Batch {
                event_types: sources.iter().flat_map(InvalidationSource::labels).collect(),
            };
            reports.push(self.invalidate_now(&feed_id, reasons.join("; "), source).await);
        }
        info!(feeds = reports.len(), "scheduled invalidations drained");
        reports
    }

    /// Number of queued reasons for `feed_id`.
    pub fn pending_for(&self, feed_id: &FeedId) -> usize {
        lock(&self.pending).get(feed_id).map_or(0, Vec::len)
    }

    pub fn has_pending(&self) -> bool {
        !lock(&self.pending).is_empty()
    }

    /// Flush pending batches before the process exits.
    pub async fn shutdown(&self) -> Vec<InvalidationReport> {
        let reports = self.drain().await;
        info!(flushed = reports.len(), "invalidation coordinator shut down");
        reports
    }

    /// Most recent reports, oldest first.
    pub fn recent_reports(&self) -> Vec<InvalidationReport> {
        lock(&self.reports).iter().cloned().collect()
    }

    fn record(&self, report: InvalidationReport) -> InvalidationReport {
        info!(
            feed_id = %report.feed_id,
            strategy = %report.strategy,
            invalidated_keys = report.invalidated_keys,
            reason = %report.reason,
            source = %report.source,
            deferred = report.deferred,
            "invalidation"
        );
        let mut reports = lock(&self.reports);
        if reports.len() == REPORT_HISTORY {
            reports.pop_front();
        }
        reports.push_back(report.clone());
        report
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use castline_core::{EpisodeId, JobId, SubmissionId};
    use castline_events::{EpisodeChange, JobOutcome, JobTerminal};

    use super::*;
    use crate::feed::{ETag, FeedCacheConfig, RenderOptions};
    use crate::invalidation::cdn::RecordingCdnClient;

    struct Fixture {
        cache: Arc<FeedCache>,
        cdn: Arc<RecordingCdnClient>,
        coordinator: InvalidationCoordinator,
    }

    fn fixture(strategy: InvalidationStrategy) -> Fixture {
        let cache = Arc::new(FeedCache::new(FeedCacheConfig::default()));
        let cdn = Arc::new(RecordingCdnClient::new());
        let config = InvalidationConfig::default()
            .with_strategy(strategy)
            .with_cdn_retry(RetryPolicy::fixed(2, Duration::from_millis(10)));
        let coordinator = InvalidationCoordinator::new(cache.clone(), cdn.clone(), config);
        Fixture { cache, cdn, coordinator }
    }

    fn feed(name: &str) -> FeedId {
        FeedId::parse(name).unwrap()
    }

    fn cached(cache: &FeedCache, feed_id: &FeedId, limit: usize) -> (CacheKey, ETag) {
        let opts = RenderOptions::default().with_limit(limit);
        let key = CacheKey::derive(feed_id, &opts);
        let etag = ETag::compute(&[], &opts);
        cache.put(key.clone(), cache.entry(key.clone(), "<rss/>", etag.clone(), 0));
        (key, etag)
    }

    fn terminal(feed_id: &FeedId) -> PipelineEvent {
        PipelineEvent::JobTerminal(JobTerminal {
            feed_id: feed_id.clone(),
            job_id: JobId::new(),
            submission_id: SubmissionId::new(),
            outcome: JobOutcome::Completed,
            error_message: None,
            occurred_at: Utc::now(),
        })
    }

    fn episode_changed(feed_id: &FeedId, change: EpisodeChange) -> EpisodeChanged {
        EpisodeChanged {
            feed_id: feed_id.clone(),
            episode_id: EpisodeId::new(),
            change,
            job_id: None,
            occurred_at: Utc::now(),
        }
    }

    fn episode_removed(feed_id: &FeedId) -> PipelineEvent {
        PipelineEvent::EpisodeChanged(episode_changed(feed_id, EpisodeChange::Removed))
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_drops_feed_entries_and_purges_once() {
        let f = fixture(InvalidationStrategy::Immediate);
        let main = feed("main");
        let (k1, e1) = cached(&f.cache, &main, 10);
        let (k2, e2) = cached(&f.cache, &main, 20);
        let (other_key, other_etag) = cached(&f.cache, &feed("other"), 10);

        let report = f.coordinator.handle_event(&terminal(&main)).await.unwrap();

        assert_eq!(report.invalidated_keys, 2);
        assert_eq!(report.source, InvalidationSource::Event { event_type: "job.terminal" });
        assert!(matches!(report.cdn, CdnOutcome::Purged { .. }));
        assert!(f.cache.get(&k1, &e1).is_none());
        assert!(f.cache.get(&k2, &e2).is_none());
        assert!(f.cache.get(&other_key, &other_etag).is_some());

        let requests = f.cdn.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].content_paths, vec!["/feeds/main", "/feeds/main/*"]);
    }

    #[tokio::test(start_paused = true)]
    async fn job_episode_change_leaves_invalidation_to_the_terminal_event() {
        let f = fixture(InvalidationStrategy::Immediate);
        let main = feed("main");
        let (key, etag) = cached(&f.cache, &main, 10);

        let from_job = PipelineEvent::EpisodeChanged(EpisodeChanged {
            job_id: Some(JobId::new()),
            ..episode_changed(&main, EpisodeChange::Published)
        });
        assert!(f.coordinator.handle_event(&from_job).await.is_none());
        assert!(f.cache.get(&key, &etag).is_some());
        assert_eq!(f.cdn.call_count(), 0);

        f.coordinator.handle_event(&terminal(&main)).await.unwrap();
        assert_eq!(f.cdn.call_count(), 1);

        let report = f.coordinator.handle_event(&episode_removed(&main)).await.unwrap();
        assert_eq!(report.source, InvalidationSource::Event { event_type: "episode.changed" });
        assert_eq!(f.cdn.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cdn_failure_is_reported_not_raised() {
        let f = fixture(InvalidationStrategy::Immediate);
        let main = feed("main");
        let (key, etag) = cached(&f.cache, &main, 10);
        f.cdn.fail_next(5);

        let report = f.coordinator.invalidate(&main, "episode removed", InvalidationSource::Manual).await;

        assert!(matches!(report.cdn, CdnOutcome::Failed { .. }));
        assert_eq!(report.invalidated_keys, 1);
        assert_eq!(f.cdn.call_count(), 2, "one retry under the test policy");
        assert!(f.cache.get(&key, &etag).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_cdn_failure_is_retried() {
        let f = fixture(InvalidationStrategy::Immediate);
        f.cdn.fail_next(1);

        let report = f.coordinator.invalidate(&feed("main"), "manual", InvalidationSource::Manual).await;
        assert!(matches!(report.cdn, CdnOutcome::Purged { .. }));
        assert_eq!(f.cdn.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_defers_until_drain_and_coalesces() {
        let f = fixture(InvalidationStrategy::Scheduled);
        let main = feed("main");
        let (key, etag) = cached(&f.cache, &main, 10);

        for _ in 0..2 {
            let report = f.coordinator.handle_event(&terminal(&main)).await.unwrap();
            assert!(report.deferred);
            assert_eq!(report.invalidated_keys, 0);
        }
        let report = f.coordinator.handle_event(&episode_removed(&main)).await.unwrap();
        assert!(report.deferred);
        assert_eq!(f.coordinator.pending_for(&main), 3);
        assert!(f.cache.get(&key, &etag).is_some());
        assert_eq!(f.cdn.call_count(), 0);

        let reports = f.coordinator.drain().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0].source,
            InvalidationSource::Batch {
                event_types: vec!["job.terminal", "job.terminal", "episode.changed"]
            }
        );
        assert_eq!(
            reports[0].source.to_string(),
            "batch of 3 (job.terminal, job.terminal, episode.changed)"
        );
        assert_eq!(reports[0].invalidated_keys, 1);
        assert_eq!(f.cdn.call_count(), 1);
        assert!(!f.coordinator.has_pending());
        assert!(f.coordinator.drain().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_pending_batches() {
        let f = fixture(InvalidationStrategy::Scheduled);
        f.coordinator.handle_event(&terminal(&feed("a"))).await;
        f.coordinator.handle_event(&terminal(&feed("b"))).await;

        let flushed = f.coordinator.shutdown().await;
        assert_eq!(flushed.len(), 2);
        assert_eq!(f.cdn.call_count(), 2);
    }

    #[tokio::test]
    async fn lazy_marks_suspect_without_removing_or_purging() {
        let f = fixture(InvalidationStrategy::Lazy);
        let main = feed("main");
        let (key, etag) = cached(&f.cache, &main, 10);

        let report = f.coordinator.handle_event(&terminal(&main)).await.unwrap();
        assert_eq!(report.invalidated_keys, 1);
        assert_eq!(report.cdn, CdnOutcome::NotRequested);
        assert!(f.cache.is_suspect(&key));
        assert_eq!(f.cdn.call_count(), 0);

        assert!(f.cache.get(&key, &etag).is_some());
        assert!(!f.cache.is_suspect(&key));
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("Scheduled".parse::<InvalidationStrategy>().unwrap(), InvalidationStrategy::Scheduled);
        assert!("eventually".parse::<InvalidationStrategy>().is_err());
    }

    #[tokio::test]
    async fn reports_are_kept_for_inspection() {
        let f = fixture(InvalidationStrategy::Lazy);
        f.coordinator.invalidate(&feed("main"), "first", InvalidationSource::Manual).await;
        f.coordinator.invalidate(&feed("main"), "second", InvalidationSource::Manual).await;

        let reasons: Vec<_> = f.coordinator.recent_reports().into_iter().map(|r| r.reason).collect();
        assert_eq!(reasons, ["first", "second"]);
    }
}
