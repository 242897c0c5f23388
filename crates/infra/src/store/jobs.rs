use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Duration;
use serde::Serialize;

use castline_core::{Clock, JobId, SubmissionId, SystemClock};
use castline_pipeline::{JobStatus, ProcessingJob};

use super::poisoned;
use crate::error::StoreError;

/// Durable home of [`ProcessingJob`] records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace a job.
    async fn save(&self, job: &ProcessingJob) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<ProcessingJob>, StoreError>;

    async fn get_by_submission_id(
        &self,
        submission_id: SubmissionId,
    ) -> Result<Option<ProcessingJob>, StoreError>;

    /// Jobs currently in `status`, oldest first.
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ProcessingJob>, StoreError>;

    /// Running jobs that started more than `older_than_hours` ago.
    async fn list_stale(&self, older_than_hours: u32) -> Result<Vec<ProcessingJob>, StoreError>;

    async fn stats(&self) -> Result<JobStats, StoreError>;
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.queued + self.running + self.completed + self.failed
    }
}

/// In-memory job store for tests/dev.
///
/// Holds a [`Clock`] so stale-job detection can run on simulated time.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, ProcessingJob>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn collect_sorted<F>(&self, filter: F) -> Result<Vec<ProcessingJob>, StoreError>
    where
        F: Fn(&ProcessingJob) -> bool,
    {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs.values().filter(|j| filter(j)).cloned().collect();
        result.sort_by_key(|j| j.created_at());
        Ok(result)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save(&self, job: &ProcessingJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        jobs.insert(job.id(), job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<ProcessingJob>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&id).cloned())
    }

    async fn get_by_submission_id(
        &self,
        submission_id: SubmissionId,
    ) -> Result<Option<ProcessingJob>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs
            .values()
            .find(|j| j.submission_id() == submission_id)
            .cloned())
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<ProcessingJob>, StoreError> {
        self.collect_sorted(|j| j.status() == status)
    }

    async fn list_stale(&self, older_than_hours: u32) -> Result<Vec<ProcessingJob>, StoreError> {
        let cutoff = self.clock.now() - Duration::hours(i64::from(older_than_hours));
        self.collect_sorted(|j| {
            j.status() == JobStatus::Running && j.started_at().is_some_and(|at| at < cutoff)
        })
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            match job.status() {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
