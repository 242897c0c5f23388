//! Caller-facing operations: submit content, poll a job, read the feed,
//! force an invalidation.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info};

use castline_core::{Clock, DomainError, FeedId, JobId, SubmissionId};
use castline_events::{EventBus, PipelineEvent};
use castline_pipeline::{ContentKind, JobStatus, SubmissionStateMachine};

use crate::episodes::EpisodeSource;
use crate::error::ServiceError;
use crate::feed::{CacheHealth, CacheKey, CacheStats, ETag, FeedCache, FeedMeta, FeedRenderer, RenderOptions};
use crate::invalidation::{InvalidationCoordinator, InvalidationReport, InvalidationSource};
use crate::jobs::JobRunner;
use crate::retry::{ExternalService, RetryConfig, RetryExecutor};
use crate::store::{JobStats, SubmissionStore};

/// What `get_job_status` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub current_step: String,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFeed {
    pub content: Arc<str>,
    pub content_type: &'static str,
    pub etag: ETag,
    pub from_cache: bool,
}

/// Collaborators the service is wired from.
pub struct ServiceParts<B> {
    pub meta: FeedMeta,
    pub submissions: Arc<dyn SubmissionStore>,
    pub episodes: Arc<dyn EpisodeSource>,
    pub runner: Arc<JobRunner<B>>,
    pub renderer: Arc<dyn FeedRenderer>,
    pub cache: Arc<FeedCache>,
    pub coordinator: Arc<InvalidationCoordinator>,
    pub clock: Arc<dyn Clock>,
}

/// The process-wide service facade.
///
/// Constructed once at startup; clones of the inner `Arc`s are shared with the
/// background workers.
pub struct CastlineService<B> {
    meta: FeedMeta,
    submissions: Arc<dyn SubmissionStore>,
    episodes: Arc<dyn EpisodeSource>,
    runner: Arc<JobRunner<B>>,
    renderer: Arc<dyn FeedRenderer>,
    cache: Arc<FeedCache>,
    coordinator: Arc<InvalidationCoordinator>,
    clock: Arc<dyn Clock>,
    source_retry: RetryConfig<ServiceError>,
    spawn_processing: bool,
}

impl<B> core::fmt::Debug for CastlineService<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CastlineService")
            .field("feed_id", &self.meta.feed_id)
            .field("spawn_processing", &self.spawn_processing)
            .finish_non_exhaustive()
    }
}

impl<B> CastlineService<B>
where
    B: EventBus<PipelineEvent> + 'static,
{
    pub fn new(parts: ServiceParts<B>) -> Self {
        Self {
            meta: parts.meta,
            submissions: parts.submissions,
            episodes: parts.episodes,
            runner: parts.runner,
            renderer: parts.renderer,
            cache: parts.cache,
            coordinator: parts.coordinator,
            clock: parts.clock,
            source_retry: RetryConfig::for_service(ExternalService::Database),
            spawn_processing: true,
        }
    }

    /// Whether `submit_content` starts processing in a background task.
    /// Disable to drive jobs through [`runner`](Self::runner) directly.
    pub fn with_background_processing(mut self, enabled: bool) -> Self {
        self.spawn_processing = enabled;
        self
    }

    pub fn feed_id(&self) -> &FeedId {
        &self.meta.feed_id
    }

    pub fn runner(&self) -> &Arc<JobRunner<B>> {
        &self.runner
    }

    /// Validate and store a submission, queue its job, and (by default)
    /// start processing it.
    pub async fn submit_content(
        &self,
        source_url: &str,
        kind: ContentKind,
        note: Option<&str>,
    ) -> Result<SubmissionId, ServiceError> {
        let submission = SubmissionStateMachine::create(source_url, kind, note, self.clock.now())?;
        let id = self.submissions.save(&submission).await?;
        let job = self.runner.enqueue(&submission).await?;
        info!(submission_id = %id, job_id = %job.id(), kind = %kind, "content submitted");

        if self.spawn_processing {
            let runner = self.runner.clone();
            let job_id = job.id();
            tokio::spawn(async move {
                if let Err(err) = runner.run(job_id).await {
                    error!(job_id = %job_id, error = %err, "background job ended in failure");
                }
            });
        }
        Ok(id)
    }

    pub async fn get_job_status(&self, submission_id: SubmissionId) -> Result<JobStatusView, ServiceError> {
        let job = self
            .runner
            .job_store()
            .get_by_submission_id(submission_id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("job for submission {submission_id}")))?;

        Ok(JobStatusView {
            job_id: job.id(),
            status: job.status(),
            progress: job.progress(),
            current_step: job.current_step().to_string(),
            error_message: job.error_message().map(str::to_string),
            retry_count: job.retry_count(),
        })
    }

    /// Serve the feed from cache when current, otherwise render and cache it.
    pub async fn get_rendered_feed(&self, options: &RenderOptions) -> Result<RenderedFeed, ServiceError> {
        options.validate()?;
        let started = Instant::now();

        let episodes = RetryExecutor::for_service(ExternalService::Database)
            .call(
                || async {
                    self.episodes
                        .list_episodes(options.limit, 0)
                        .await
                        .map_err(ServiceError::from)
                },
                &self.source_retry,
            )
            .await?;

        let key = CacheKey::derive(&self.meta.feed_id, options);
        let etag = ETag::compute(&episodes, options);

        let feed = match self.cache.get(&key, &etag) {
            Some(entry) => {
                debug!(key = %key, etag = %etag, "feed served from cache");
                RenderedFeed {
                    content: entry.content,
                    content_type: self.renderer.content_type(),
                    etag,
                    from_cache: true,
                }
            }
            None => {
                let body: Arc<str> = self.renderer.render(&self.meta, &episodes, options).into();
                self.cache
                    .put(key.clone(), self.cache.entry(key.clone(), body.clone(), etag.clone(), episodes.len()));
                debug!(key = %key, etag = %etag, bytes = body.len(), "feed rendered");
                RenderedFeed {
                    content: body,
                    content_type: self.renderer.content_type(),
                    etag,
                    from_cache: false,
                }
            }
        };

        self.cache.record_response_time(started.elapsed());
        Ok(feed)
    }

    /// Drop this feed's cached renderings and purge the CDN now, whatever the
    /// configured strategy.
    pub async fn invalidate_feed(&self, reason: &str) -> InvalidationReport {
        self.coordinator
            .invalidate_now(&self.meta.feed_id, reason, InvalidationSource::Manual)
            .await
    }

    pub async fn episode_count(&self) -> Result<usize, ServiceError> {
        Ok(self.episodes.count().await?)
    }

    pub async fn job_stats(&self) -> Result<JobStats, ServiceError> {
        Ok(self.runner.job_store().stats().await?)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache_health(&self) -> CacheHealth {
        self.cache.health()
    }
}
