//! Persistence seams.
//!
//! The durable stores are external collaborators; only their shapes live
//! here, plus in-memory implementations for tests and single-process runs.
//! `update_status` applies its transition to the stored record under one
//! write lock. `save` is a blind insert-or-replace with no version check, so
//! concurrent writers of the same record are last-writer-wins.

pub mod jobs;
pub mod submissions;

pub use jobs::{InMemoryJobStore, JobStats, JobStore};
pub use submissions::{InMemorySubmissionStore, SubmissionStore};

use crate::error::StoreError;

pub(crate) fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("store lock poisoned".to_string())
}
