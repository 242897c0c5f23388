//! Infrastructure error taxonomy.
//!
//! State-machine guard violations arrive as [`DomainError`] and are surfaced
//! unchanged (client errors). Collaborator failures are retried per policy and
//! become [`ServiceError::RetryExhausted`] once the budget is spent (server
//! errors). Cache failures never show up here at all; see
//! [`crate::feed::CacheDegradedError`].

use std::time::Duration;

use thiserror::Error;

use castline_core::DomainError;

/// Failure reported by a persistence collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("write conflict: {0}")]
    Conflict(String),
    /// Transient unavailability (connection reset, timeout, pool exhausted).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Error returned by every operation exposed to callers.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A collaborator (extraction, TTS, CDN, ...) failed.
    #[error("{service} failed: {message}")]
    ExternalService {
        service: &'static str,
        message: String,
    },

    /// Every allowed attempt failed; wraps the last underlying error.
    #[error("gave up after {attempts} attempt(s) in {elapsed:?}: {source}")]
    RetryExhausted {
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: Box<ServiceError>,
    },
}

impl ServiceError {
    pub fn external(service: &'static str, message: impl Into<String>) -> Self {
        Self::ExternalService {
            service,
            message: message.into(),
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::ExternalService { .. } => true,
            ServiceError::Store(e) => e.is_transient(),
            ServiceError::Domain(_) | ServiceError::RetryExhausted { .. } => false,
        }
    }

    /// Caller's fault (4xx-equivalent) as opposed to ours or a collaborator's.
    pub fn is_client_error(&self) -> bool {
        match self {
            ServiceError::Domain(_) => true,
            ServiceError::Store(StoreError::NotFound(_)) => true,
            ServiceError::Store(_)
            | ServiceError::ExternalService { .. }
            | ServiceError::RetryExhausted { .. } => false,
        }
    }

    /// Peel off `RetryExhausted` wrappers.
    pub fn root_cause(&self) -> &ServiceError {
        match self {
            ServiceError::RetryExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
