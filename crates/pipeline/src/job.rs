use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use castline_core::{DomainError, DomainResult, JobId, SubmissionId};

/// Processing job status lifecycle.
///
/// ```text
/// queued ──start──> running ──complete──> completed
///    ^                 │  ^
///    │                 │  └─progress
///    └────retry──── failed <──fail──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        })
    }
}

/// Command: request a lifecycle change on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum JobCommand {
    Start,
    Progress { progress: u8, step: Option<String> },
    Complete,
    Fail { error: String },
    Retry,
}

impl JobCommand {
    /// The state this command tries to move the job into.
    pub fn target(&self) -> JobStatus {
        match self {
            JobCommand::Start | JobCommand::Progress { .. } => JobStatus::Running,
            JobCommand::Complete => JobStatus::Completed,
            JobCommand::Fail { .. } => JobStatus::Failed,
            JobCommand::Retry => JobStatus::Queued,
        }
    }
}

/// The internal unit of work tracking processing of one submission.
///
/// Every transition is a pure function from the old value to a new one; the
/// stored job is replaced, never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingJob {
    id: JobId,
    submission_id: SubmissionId,
    status: JobStatus,
    progress: u8,
    current_step: String,
    error_message: Option<String>,
    retry_count: u32,
    max_retries: u32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProcessingJob {
    /// A freshly queued job for `submission_id`.
    pub fn new(submission_id: SubmissionId, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            submission_id,
            status: JobStatus::Queued,
            progress: 0,
            current_step: "queued".to_string(),
            error_message: None,
            retry_count: 0,
            max_retries,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn submission_id(&self) -> SubmissionId {
        self.submission_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn current_step(&self) -> &str {
        &self.current_step
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// True iff the job failed and still has retry budget.
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < self.max_retries
    }

    /// True once the job will not move again without outside intervention:
    /// completed, or failed with the retry budget spent.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Completed => true,
            JobStatus::Failed => !self.can_retry(),
            JobStatus::Queued | JobStatus::Running => false,
        }
    }

    /// Decide the successor state for `command`.
    ///
    /// Never mutates `self`; a rejected command leaves the caller holding the
    /// original value.
    pub fn handle(&self, command: &JobCommand, now: DateTime<Utc>) -> DomainResult<ProcessingJob> {
        match (self.status, command) {
            (JobStatus::Queued, JobCommand::Start) => Ok(ProcessingJob {
                status: JobStatus::Running,
                current_step: "started".to_string(),
                started_at: Some(now),
                updated_at: now,
                ..self.clone()
            }),
            (JobStatus::Running, JobCommand::Progress { progress, step }) => {
                self.handle_progress(*progress, step.as_deref(), now)
            }
            (JobStatus::Running, JobCommand::Complete) => {
                let finished = self.finish_time(now);
                Ok(ProcessingJob {
                    status: JobStatus::Completed,
                    progress: 100,
                    current_step: "completed".to_string(),
                    completed_at: Some(finished),
                    updated_at: finished,
                    ..self.clone()
                })
            }
            (JobStatus::Running, JobCommand::Fail { error }) => {
                let error = error.trim();
                if error.is_empty() {
                    return Err(DomainError::validation(
                        "a failed job requires an error message",
                    ));
                }
                let finished = self.finish_time(now);
                Ok(ProcessingJob {
                    status: JobStatus::Failed,
                    error_message: Some(error.to_string()),
                    completed_at: Some(finished),
                    updated_at: finished,
                    ..self.clone()
                })
            }
            (JobStatus::Failed, JobCommand::Retry) => {
                if !self.can_retry() {
                    // retries exhausted
                    return Err(DomainError::invalid_job_transition(self.status, JobStatus::Queued));
                }
                Ok(ProcessingJob {
                    status: JobStatus::Queued,
                    progress: 0,
                    current_step: "queued for retry".to_string(),
                    error_message: None,
                    retry_count: self.retry_count + 1,
                    started_at: None,
                    completed_at: None,
                    updated_at: now,
                    ..self.clone()
                })
            }
            (from, command) => Err(DomainError::invalid_job_transition(from, command.target())),
        }
    }

    /// `now`, but never earlier than `started_at`: a clock that steps
    /// backwards must not produce `completed_at < started_at`.
    fn finish_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.started_at.map_or(now, |started| started.max(now))
    }

    fn handle_progress(
        &self,
        progress: u8,
        step: Option<&str>,
        now: DateTime<Utc>,
    ) -> DomainResult<ProcessingJob> {
        if progress > 100 {
            return Err(DomainError::validation(format!(
                "progress must be between 0 and 100, got {progress}"
            )));
        }
        if progress < self.progress {
            return Err(DomainError::validation(format!(
                "progress may not go backwards ({} -> {progress})",
                self.progress
            )));
        }

        let current_step = match step.map(str::trim) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => self.current_step.clone(),
        };

        Ok(ProcessingJob {
            progress,
            current_step,
            updated_at: now,
            ..self.clone()
        })
    }

    pub fn start(&self, now: DateTime<Utc>) -> DomainResult<ProcessingJob> {
        self.handle(&JobCommand::Start, now)
    }

    pub fn update_progress(
        &self,
        progress: u8,
        step: Option<&str>,
        now: DateTime<Utc>,
    ) -> DomainResult<ProcessingJob> {
        self.handle(
            &JobCommand::Progress {
                progress,
                step: step.map(str::to_string),
            },
            now,
        )
    }

    pub fn complete(&self, now: DateTime<Utc>) -> DomainResult<ProcessingJob> {
        self.handle(&JobCommand::Complete, now)
    }

    pub fn fail(&self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<ProcessingJob> {
        self.handle(&JobCommand::Fail { error: error.into() }, now)
    }

    pub fn retry(&self, now: DateTime<Utc>) -> DomainResult<ProcessingJob> {
        self.handle(&JobCommand::Retry, now)
    }
}
