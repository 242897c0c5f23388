//! Job execution: the runner loop and the content-processing seam.
//!
//! - `JobRunner` drives one job from `queued` to a final outcome, retrying
//!   transient failures with backoff and keeping the submission in step
//! - `ContentProcessor` is the excluded extraction/TTS pipeline as one call
//! - `ProgressReporter` lets the processor record progress as it goes

pub mod processor;
pub mod runner;

pub use processor::{ContentProcessor, PassthroughProcessor, ProgressReporter};
pub use runner::{JobRunner, JobRunnerConfig};
