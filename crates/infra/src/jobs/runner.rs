//! Drives processing jobs through their lifecycle.
//!
//! One call to [`JobRunner::run`] takes a queued job to a final outcome:
//!
//! ```text
//! queued -> running -> completed
//!                   \-> failed -(retry, backoff)-> queued -> running -> ...
//! ```
//!
//! The submission record follows along (`pending -> processing -> completed|failed`)
//! and a `JobTerminal` event is published once the job will not move again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use castline_core::{Clock, DomainError, FeedId, JobId, SubmissionId, SystemClock};
use castline_events::{EpisodeChanged, EventBus, JobOutcome, JobTerminal, PipelineEvent};
use castline_pipeline::{ContentSubmission, JobStatus, ProcessingJob, SubmissionStatus};

use super::processor::{ContentProcessor, ProgressReporter};
use crate::episodes::{Episode, EpisodeSink};
use crate::error::ServiceError;
use crate::retry::{ExternalService, RetryConfig, RetryExecutor, RetryPolicy};
use crate::store::{JobStore, SubmissionStore};

/// Job runner configuration.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Feed that finished episodes are published to.
    pub feed_id: FeedId,
    /// `max_retries` given to new jobs.
    pub max_retries: u32,
    /// Delay between job-level retries; only the delay schedule is used, the
    /// attempt budget is the job's own `max_retries`.
    pub job_backoff: RetryPolicy,
    /// Retries for store writes.
    pub store_retry: RetryPolicy,
}

impl JobRunnerConfig {
    pub fn new(feed_id: FeedId) -> Self {
        Self {
            feed_id,
            max_retries: 3,
            job_backoff: RetryPolicy::exponential(4, Duration::from_secs(5), Duration::from_secs(120)),
            store_retry: RetryPolicy::for_service(ExternalService::Database),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_job_backoff(mut self, policy: RetryPolicy) -> Self {
        self.job_backoff = policy;
        self
    }

    pub fn with_store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }
}

/// Runs jobs against a [`ContentProcessor`], persisting every transition.
pub struct JobRunner<B> {
    submissions: Arc<dyn SubmissionStore>,
    jobs: Arc<dyn JobStore>,
    processor: Arc<dyn ContentProcessor>,
    episodes: Arc<dyn EpisodeSink>,
    bus: B,
    clock: Arc<dyn Clock>,
    config: JobRunnerConfig,
    store_retry: RetryConfig<ServiceError>,
}

impl<B> core::fmt::Debug for JobRunner<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobRunner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// How one attempt ended.
struct Attempt {
    job: ProcessingJob,
    error: Option<ServiceError>,
}

impl<B> JobRunner<B>
where
    B: EventBus<PipelineEvent>,
{
    pub fn new(
        submissions: Arc<dyn SubmissionStore>,
        jobs: Arc<dyn JobStore>,
        processor: Arc<dyn ContentProcessor>,
        episodes: Arc<dyn EpisodeSink>,
        bus: B,
        config: JobRunnerConfig,
    ) -> Self {
        let store_retry = RetryConfig::new(config.store_retry.clone())
            .with_retry_condition(ServiceError::is_retryable);
        Self {
            submissions,
            jobs,
            processor,
            episodes,
            bus,
            clock: Arc::new(SystemClock),
            config,
            store_retry,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &JobRunnerConfig {
        &self.config
    }

    pub fn job_store(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Create and persist a queued job for `submission`.
    pub async fn enqueue(&self, submission: &ContentSubmission) -> Result<ProcessingJob, ServiceError> {
        let job = ProcessingJob::new(submission.id(), self.config.max_retries, self.clock.now());
        self.save_job(&job).await?;
        info!(job_id = %job.id(), submission_id = %submission.id(), "job queued");
        Ok(job)
    }

    /// Take a queued job to its final outcome.
    ///
    /// Returns the completed job. A failure the runner gives up on is
    /// surfaced as an error: the last processing error when it was not
    /// retryable, [`ServiceError::RetryExhausted`] once the job's retry
    /// budget is spent. The failed job is persisted either way.
    pub async fn run(&self, job_id: JobId) -> Result<ProcessingJob, ServiceError> {
        let started = Instant::now();
        let mut job = self.load_job(job_id).await?;

        loop {
            let Attempt { job: attempted, error } = self.run_attempt(job).await?;
            job = attempted;

            let Some(err) = error else {
                self.publish_terminal(&job, JobOutcome::Completed);
                return Ok(job);
            };

            if job.can_retry() && err.is_retryable() {
                let delay = self.config.job_backoff.delay_for_attempt(job.retry_count() + 1);
                warn!(
                    job_id = %job.id(),
                    retry = job.retry_count() + 1,
                    max_retries = job.max_retries(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "job failed, retrying"
                );
                tokio::time::sleep(delay).await;

                job = job.retry(self.clock.now())?;
                self.save_job(&job).await?;
                continue;
            }

            let message = job.error_message().unwrap_or("processing failed").to_string();
            self.finish_submission(&job, SubmissionStatus::Failed, Some(message)).await;
            self.publish_terminal(&job, JobOutcome::Failed);

            error!(job_id = %job.id(), attempts = job.retry_count() + 1, error = %err, "job failed permanently");
            return Err(if err.is_retryable() {
                ServiceError::RetryExhausted {
                    attempts: job.retry_count() + 1,
                    elapsed: started.elapsed(),
                    source: Box::new(err),
                }
            } else {
                err
            });
        }
    }

    async fn run_attempt(&self, job: ProcessingJob) -> Result<Attempt, ServiceError> {
        let job = job.start(self.clock.now())?;
        self.save_job(&job).await?;
        debug!(job_id = %job.id(), attempt = job.retry_count() + 1, "job started");

        let (job_id, submission_id) = (job.id(), job.submission_id());
        let submission = self
            .with_store_retry(|| async { self.submissions.get(submission_id).await.map_err(ServiceError::from) })
            .await?
            .ok_or_else(|| DomainError::not_found(format!("submission {submission_id}")))?;

        let submission = if submission.status() == SubmissionStatus::Pending {
            self.update_submission(submission_id, SubmissionStatus::Processing, None).await?
        } else {
            submission
        };

        let reporter = ProgressReporter::new(job, self.jobs.clone(), self.clock.clone(), self.store_retry.clone());
        let outcome = match self.processor.process(&submission, &reporter).await {
            Ok(episode) => self.publish_episode(job_id, episode).await,
            Err(err) => Err(err),
        };
        let job = reporter.current();

        match outcome {
            Ok(()) => {
                let job = job.complete(self.clock.now())?;
                self.save_job(&job).await?;
                self.finish_submission(&job, SubmissionStatus::Completed, None).await;
                info!(job_id = %job.id(), "job completed");
                Ok(Attempt { job, error: None })
            }
            Err(err) => {
                let job = job.fail(err.to_string(), self.clock.now())?;
                self.save_job(&job).await?;
                Ok(Attempt { job, error: Some(err) })
            }
        }
    }

    async fn publish_episode(&self, job_id: JobId, episode: Episode) -> Result<(), ServiceError> {
        let episode_id = episode.id;
        let change = self
            .with_store_retry(|| {
                let episode = episode.clone();
                async move { self.episodes.publish(episode).await.map_err(ServiceError::from) }
            })
            .await?;

        // The job's JobTerminal carries the cache invalidation.
        self.publish(PipelineEvent::EpisodeChanged(EpisodeChanged {
            feed_id: self.config.feed_id.clone(),
            episode_id,
            change,
            job_id: Some(job_id),
            occurred_at: self.clock.now(),
        }));
        Ok(())
    }

    /// Fail running jobs that started more than `older_than_hours` ago.
    ///
    /// Jobs with retry budget left go back to `queued`; the rest are final
    /// and publish their terminal event. Returns the reaped jobs as stored.
    pub async fn reap_stale(&self, older_than_hours: u32) -> Result<Vec<ProcessingJob>, ServiceError> {
        let stale = self.jobs.list_stale(older_than_hours).await?;
        let mut reaped = Vec::with_capacity(stale.len());

        for job in stale {
            let now = self.clock.now();
            let failed = job.fail(format!("timed out: running for more than {older_than_hours}h"), now)?;

            let stored = if failed.can_retry() {
                failed.retry(now)?
            } else {
                failed
            };
            self.save_job(&stored).await?;

            if stored.status() == JobStatus::Failed {
                let message = stored.error_message().unwrap_or("timed out").to_string();
                self.finish_submission(&stored, SubmissionStatus::Failed, Some(message)).await;
                self.publish_terminal(&stored, JobOutcome::Failed);
            }
            warn!(job_id = %stored.id(), status = %stored.status(), "stale job reaped");
            reaped.push(stored);
        }

        Ok(reaped)
    }

    async fn finish_submission(&self, job: &ProcessingJob, status: SubmissionStatus, message: Option<String>) {
        if let Err(err) = self.update_submission(job.submission_id(), status, message).await {
            // A submission already in a terminal state cannot move; the job record is authoritative.
            warn!(job_id = %job.id(), submission_id = %job.submission_id(), error = %err, "submission status not updated");
        }
    }

    fn publish_terminal(&self, job: &ProcessingJob, outcome: JobOutcome) {
        self.publish(PipelineEvent::JobTerminal(JobTerminal {
            feed_id: self.config.feed_id.clone(),
            job_id: job.id(),
            submission_id: job.submission_id(),
            outcome,
            error_message: job.error_message().map(str::to_string),
            occurred_at: self.clock.now(),
        }));
    }

    fn publish(&self, event: PipelineEvent) {
        let description = event.describe();
        match self.bus.publish(event) {
            Ok(delivered) => debug!(event = %description, delivered, "event published"),
            Err(err) => warn!(event = %description, error = %err, "event publish failed"),
        }
    }

    async fn load_job(&self, job_id: JobId) -> Result<ProcessingJob, ServiceError> {
        let job = self.with_store_retry(|| async { self.jobs.get(job_id).await.map_err(ServiceError::from) }).await?;
        Ok(job.ok_or_else(|| DomainError::not_found(format!("job {job_id}")))?)
    }

    async fn save_job(&self, job: &ProcessingJob) -> Result<(), ServiceError> {
        self.with_store_retry(|| async { self.jobs.save(job).await.map_err(ServiceError::from) }).await
    }

    async fn update_submission(
        &self,
        id: SubmissionId,
        status: SubmissionStatus,
        message: Option<String>,
    ) -> Result<ContentSubmission, ServiceError> {
        self.with_store_retry(|| {
            let message = message.clone();
            async move { self.submissions.update_status(id, status, message, self.clock.now()).await }
        })
        .await
    }

    /// Run a store call under the store retry policy. Only transient store
    /// errors are retried; a rejected transition fails on the first attempt.
    async fn with_store_retry<T, F, Fut>(&self, operation: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        RetryExecutor::for_service(ExternalService::Database)
            .call(operation, &self.store_retry)
            .await
    }
}
