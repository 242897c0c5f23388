//! Seam to the excluded content pipeline (extraction, script generation,
//! speech synthesis, upload), seen by the runner as one opaque call.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use castline_core::Clock;
use castline_pipeline::{ContentSubmission, ProcessingJob};

use crate::episodes::Episode;
use crate::error::ServiceError;
use crate::retry::{ExternalService, RetryConfig, RetryExecutor};
use crate::store::JobStore;

/// Turns a submission into a finished episode.
///
/// Errors for which [`ServiceError::is_retryable`] holds lead to a job-level
/// retry; anything else fails the job for good.
#[async_trait]
pub trait ContentProcessor: Send + Sync {
    async fn process(
        &self,
        submission: &ContentSubmission,
        progress: &ProgressReporter,
    ) -> Result<Episode, ServiceError>;
}

/// Applies progress transitions to the running job and persists them.
pub struct ProgressReporter {
    job: Mutex<ProcessingJob>,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig<ServiceError>,
}

impl core::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job", &self.current())
            .finish_non_exhaustive()
    }
}

impl ProgressReporter {
    pub(crate) fn new(
        job: ProcessingJob,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        retry: RetryConfig<ServiceError>,
    ) -> Self {
        Self {
            job: Mutex::new(job),
            store,
            clock,
            retry,
        }
    }

    /// Record `progress` (0-100, never decreasing) with an optional step label.
    pub async fn report(&self, progress: u8, step: Option<&str>) -> Result<(), ServiceError> {
        let next = {
            let mut job = self.job.lock().unwrap_or_else(PoisonError::into_inner);
            let next = job.update_progress(progress, step, self.clock.now())?;
            *job = next.clone();
            next
        };
        debug!(job_id = %next.id(), progress, step = step.unwrap_or(""), "job progress");
        RetryExecutor::for_service(ExternalService::Database)
            .call(|| async { self.store.save(&next).await.map_err(ServiceError::from) }, &self.retry)
            .await
    }

    /// Latest job value, including every reported update.
    pub fn current(&self) -> ProcessingJob {
        self.job.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Stand-in for the external pipeline in single-process runs: reports the
/// usual steps and yields an episode that points back at the source.
#[derive(Debug, Clone)]
pub struct PassthroughProcessor {
    pub audio_base_url: String,
}

impl PassthroughProcessor {
    pub fn new(audio_base_url: impl Into<String>) -> Self {
        Self {
            audio_base_url: audio_base_url.into(),
        }
    }
}

#[async_trait]
impl ContentProcessor for PassthroughProcessor {
    async fn process(
        &self,
        submission: &ContentSubmission,
        progress: &ProgressReporter,
    ) -> Result<Episode, ServiceError> {
        progress.report(25, Some("extracting")).await?;
        progress.report(50, Some("scripting")).await?;
        progress.report(75, Some("synthesizing")).await?;

        let now = progress.clock.now();
        let base = self.audio_base_url.trim_end_matches('/');
        let mut episode = Episode::new(
            submission.source_url(),
            format!("{base}/{}.mp3", submission.id()),
            now,
        );
        episode.submission_id = Some(submission.id());
        episode.description = submission.note().unwrap_or_default().to_string();

        progress.report(90, Some("publishing")).await?;
        Ok(episode)
    }
}
