//! Errors raised by the pure model types (queue items, run records, ids).

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic model failure.
///
/// Raised before anything touches storage or the network: a new queue item
/// with `max_attempts = 0`, a second completion of a run record, an empty
/// runner id. Adapters translate these into their own error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Input rejected at construction time.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A state transition the model does not allow (e.g. completing a
    /// terminal run record).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
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

    /// True when retrying the same call can never succeed because the
    /// target already moved past the requested transition.
    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}
