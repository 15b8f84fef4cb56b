//! Service-level error union.

use thiserror::Error;

use stockledger_core::{DomainError, ErrorClass};

use crate::store::StoreError;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Failure of a ledger/workflow/opname operation.
///
/// Domain errors are deterministic and never retried. Store errors carry the
/// infrastructure outcome; only `StoreError::Contention` is retryable.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    /// Lock timeouts, deadlocks and serialization failures.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Store(StoreError::Contention(_)))
    }

    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            ServiceError::Domain(err) => Some(err),
            ServiceError::Store(_) => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ServiceError::Domain(err) => err.class(),
            ServiceError::Store(StoreError::NotFound(_)) => ErrorClass::NotFound,
            ServiceError::Store(StoreError::Conflict(_) | StoreError::Contention(_)) => {
                ErrorClass::Conflict
            }
            ServiceError::Store(StoreError::Backend(_)) => ErrorClass::Integrity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_contention_is_retryable() {
        assert!(ServiceError::from(StoreError::Contention("deadlock".into())).is_retryable());
        assert!(!ServiceError::from(StoreError::Conflict("version".into())).is_retryable());
        assert!(!ServiceError::from(DomainError::validation("qty")).is_retryable());
    }
}
