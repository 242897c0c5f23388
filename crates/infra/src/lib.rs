//! Infrastructure layer: retries, stores, job execution, the feed cache and
//! its invalidation, background workers, config.

pub mod config;
pub mod episodes;
pub mod error;
pub mod feed;
pub mod invalidation;
pub mod jobs;
pub mod retry;
pub mod service;
pub mod store;
pub mod workers;

pub use error::{ServiceError, StoreError};
pub use service::{CastlineService, JobStatusView, RenderedFeed, ServiceParts};
