//! Generic bounded-retry-with-backoff used by the job runner and by every call
//! into an external collaborator.

pub mod executor;
pub mod policy;

pub use executor::{Attempted, RetryConfig, RetryExecutor, RetryFailure};
pub use policy::{BackoffStrategy, ExternalService, RetryPolicy};
