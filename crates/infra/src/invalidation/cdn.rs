//! CDN purge collaborator.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeRequest {
    pub content_paths: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReceipt {
    pub success: bool,
    pub purge_id: String,
    pub estimated_completion: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait CdnPurgeClient: Send + Sync {
    async fn purge(&self, request: PurgeRequest) -> Result<PurgeReceipt, ServiceError>;
}

/// Client for deployments without a CDN: logs the request and reports success.
#[derive(Debug, Default)]
pub struct LogOnlyCdnClient {
    next_id: AtomicU64,
}

#[async_trait]
impl CdnPurgeClient for LogOnlyCdnClient {
    async fn purge(&self, request: PurgeRequest) -> Result<PurgeReceipt, ServiceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            paths = ?request.content_paths,
            reason = %request.reason,
            purge_id = id,
            "cdn purge requested (no cdn configured)"
        );
        Ok(PurgeReceipt {
            success: true,
            purge_id: format!("local-{id}"),
            estimated_completion: None,
        })
    }
}

/// In-memory client that records every request.
///
/// `fail_next(n)` makes the next `n` calls fail with a retryable error.
#[derive(Debug, Default)]
pub struct RecordingCdnClient {
    requests: Mutex<Vec<PurgeRequest>>,
    failures_remaining: AtomicU32,
}

impl RecordingCdnClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Every call, including failed ones.
    pub fn requests(&self) -> Vec<PurgeRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl CdnPurgeClient for RecordingCdnClient {
    async fn purge(&self, request: PurgeRequest) -> Result<PurgeReceipt, ServiceError> {
        let call = {
            let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
            requests.push(request);
            requests.len()
        };

        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(ServiceError::external("cdn-purge", "simulated purge failure"));
        }

        Ok(PurgeReceipt {
            success: true,
            purge_id: format!("rec-{call}"),
            estimated_completion: Some(Utc::now() + chrono::Duration::seconds(30)),
        })
    }
}
