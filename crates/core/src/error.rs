//! Domain error model.

use thiserror::Error;

/// Result alias used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic, business-level failure.
///
/// Storage, transport, and serialization failures are infrastructure errors
/// and live in `pulse-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Input failed validation (malformed or out of range).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant would be violated by the requested change.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The addressed aggregate does not exist.
    #[error("not found")]
    NotFound,

    /// A conflicting state change (stale version, duplicate create, ...).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The acting principal is not allowed to perform the operation.
    #[error("unauthorized")]
    Unauthorized,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}
