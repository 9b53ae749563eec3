//! Domain error model.

use thiserror::Error;

use crate::task::TaskStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only (validation, lifecycle rules). Storage and
/// remote-queue failures belong to the infra layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. empty task type).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A status change that the lifecycle graph does not allow.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// A record invariant would be broken by the requested change.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}
