//! Domain error model.

use thiserror::Error;

use crate::id::AggregateId;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, conflicts). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input, non-positive quantity).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found: {0}")]
    NotFound(String),

    /// A conflict occurred (e.g. stale version, duplicate identity).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The acting user lacks the capability an operation requires.
    #[error("unauthorized: missing capability {0}")]
    Unauthorized(String),

    /// Issuing would drive the item's stock below zero.
    #[error("insufficient stock for item {item_id}: requested {requested}, available {available}")]
    InsufficientStock {
        item_id: AggregateId,
        requested: i64,
        available: i64,
    },

    /// A unit-conversion link crosses scopes, dangles, or forms a cycle.
    #[error("invalid conversion link: {0}")]
    InvalidConversionLink(String),

    /// The item has no reference (base) unit to convert into.
    #[error("item {0} has no reference unit to convert into")]
    NotConvertible(AggregateId),

    /// The requested event is not legal from the current state.
    #[error("invalid transition: cannot {event} when {from}")]
    InvalidTransition { from: String, event: String },

    /// An opname line's recorded snapshot no longer matches live stock.
    #[error("stale opname line for item {item_id}: recorded {recorded}, live stock {live}")]
    StaleOpname {
        item_id: AggregateId,
        recorded: i64,
        live: i64,
    },
}

/// Coarse classification used by callers to decide how to surface a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected before any mutation; retry after correcting input.
    Validation,
    /// Business-rule failure; never retried automatically.
    Conflict,
    /// Configuration/data error; fatal to the request and worth operator attention.
    Integrity,
    NotFound,
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

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_link(msg: impl Into<String>) -> Self {
        Self::InvalidConversionLink(msg.into())
    }

    pub fn invalid_transition(from: impl Into<String>, event: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            event: event.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            DomainError::Validation(_)
            | DomainError::InvalidId(_)
            | DomainError::InvalidTransition { .. }
            | DomainError::NotConvertible(_) => ErrorClass::Validation,
            DomainError::Conflict(_)
            | DomainError::InsufficientStock { .. }
            | DomainError::StaleOpname { .. } => ErrorClass::Conflict,
            DomainError::InvariantViolation(_) | DomainError::InvalidConversionLink(_) => {
                ErrorClass::Integrity
            }
            DomainError::NotFound(_) => ErrorClass::NotFound,
            DomainError::Unauthorized(_) => ErrorClass::Unauthorized,
        }
    }
}
