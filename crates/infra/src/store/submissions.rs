use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use castline_core::{DomainError, SubmissionId};
use castline_pipeline::{ContentSubmission, SubmissionStatus};

use super::poisoned;
use crate::error::{ServiceError, StoreError};

/// Durable home of [`ContentSubmission`] records.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Insert or replace a submission.
    async fn save(&self, submission: &ContentSubmission) -> Result<SubmissionId, StoreError>;

    async fn get(&self, id: SubmissionId) -> Result<Option<ContentSubmission>, StoreError>;

    /// Apply a lifecycle transition to the stored record and persist the result.
    ///
    /// Rejected transitions leave the stored value untouched and surface as
    /// [`ServiceError::Domain`].
    async fn update_status(
        &self,
        id: SubmissionId,
        status: SubmissionStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ContentSubmission, ServiceError>;
}

#[derive(Debug, Default)]
pub struct InMemorySubmissionStore {
    submissions: RwLock<HashMap<SubmissionId, ContentSubmission>>,
}

impl InMemorySubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.submissions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SubmissionStore for InMemorySubmissionStore {
    async fn save(&self, submission: &ContentSubmission) -> Result<SubmissionId, StoreError> {
        let mut submissions = self.submissions.write().map_err(poisoned)?;
        submissions.insert(submission.id(), submission.clone());
        Ok(submission.id())
    }

    async fn get(&self, id: SubmissionId) -> Result<Option<ContentSubmission>, StoreError> {
        let submissions = self.submissions.read().map_err(poisoned)?;
        Ok(submissions.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: SubmissionId,
        status: SubmissionStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ContentSubmission, ServiceError> {
        let mut submissions = self.submissions.write().map_err(poisoned)?;
        let current = submissions
            .get(&id)
            .ok_or_else(|| DomainError::not_found(format!("submission {id}")))?;

        let next = current.transition(status, error_message, now)?;
        submissions.insert(id, next.clone());
        Ok(next)
    }
}
