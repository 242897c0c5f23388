//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, lifecycle ordering).
/// None of these are ever retried; infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A submission was asked to move to a state its current state does not allow.
    #[error("invalid submission transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A processing job was asked to move to a state its current state does not allow.
    #[error("invalid job transition: {from} -> {to}")]
    InvalidJobTransition { from: String, to: String },

    /// A requested record was not found.
    #[error("not found: {0}")]
    NotFound(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn invalid_job_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidJobTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Whether this error signals an ordering bug rather than bad input.
    pub fn is_transition_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. } | Self::InvalidJobTransition { .. }
        )
    }
}
