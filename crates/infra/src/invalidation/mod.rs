//! Cache invalidation in response to pipeline changes.

pub mod cdn;
pub mod coordinator;

pub use cdn::{CdnPurgeClient, LogOnlyCdnClient, PurgeReceipt, PurgeRequest, RecordingCdnClient};
pub use coordinator::{
    CdnOutcome, InvalidationConfig, InvalidationCoordinator, InvalidationReport, InvalidationSource,
    InvalidationStrategy,
};
