//! Content submission and processing job lifecycles.
//!
//! This crate contains the state machines only, implemented purely as
//! deterministic domain logic (no IO, no clocks, no storage). Every transition
//! takes `now` from the caller and returns a new value.

pub mod job;
pub mod submission;

pub use job::{JobCommand, JobStatus, ProcessingJob};
pub use submission::{
    ContentKind, ContentSubmission, SubmissionStateMachine, SubmissionStatus, validate_source_url,
};
