//! The module contains the errors the accounting engine can return.
//!
//! Validation errors ([`InvalidQuota`], [`InvalidPeriod`], [`InvalidUsage`],
//! [`InvalidAllocation`], [`InvalidOwner`], [`KeyNotFound`]) are raised before
//! any state is touched. [`Database`] is the only transient error: the
//! in-memory state stays valid and the write can be retried.
//!
//! Broken invariants are not errors. They go through
//! [`invariant_violation`], which never returns.
//!
//!  [`InvalidQuota`]: AccountingError::InvalidQuota
//!  [`InvalidPeriod`]: AccountingError::InvalidPeriod
//!  [`InvalidUsage`]: AccountingError::InvalidUsage
//!  [`InvalidAllocation`]: AccountingError::InvalidAllocation
//!  [`InvalidOwner`]: AccountingError::InvalidOwner
//!  [`KeyNotFound`]: AccountingError::KeyNotFound
//!  [`Database`]: AccountingError::Database
use sea_orm::DbErr;
use thiserror::Error;

/// Accounting custom errors.
#[derive(Error, Debug)]
pub enum AccountingError {
    #[error("Invalid quota: {0}")]
    InvalidQuota(String),
    #[error("Invalid period: {0}")]
    InvalidPeriod(String),
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),
    #[error("Invalid allocation: {0}")]
    InvalidAllocation(String),
    #[error("Invalid owner: {0}")]
    InvalidOwner(String),
    #[error("\"{0}\" key not found!")]
    KeyNotFound(String),
    #[error(transparent)]
    Database(#[from] DbErr),
}

impl AccountingError {
    /// HTTP-style status code for the RPC layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidQuota(_)
            | Self::InvalidPeriod(_)
            | Self::InvalidUsage(_)
            | Self::InvalidAllocation(_)
            | Self::InvalidOwner(_) => 400,
            Self::KeyNotFound(_) => 404,
            Self::Database(_) => 503,
        }
    }

    /// Only persistence failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl PartialEq for AccountingError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidQuota(a), Self::InvalidQuota(b)) => a == b,
            (Self::InvalidPeriod(a), Self::InvalidPeriod(b)) => a == b,
            (Self::InvalidUsage(a), Self::InvalidUsage(b)) => a == b,
            (Self::InvalidAllocation(a), Self::InvalidAllocation(b)) => a == b,
            (Self::InvalidOwner(a), Self::InvalidOwner(b)) => a == b,
            (Self::KeyNotFound(a), Self::KeyNotFound(b)) => a == b,
            (Self::Database(a), Self::Database(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}

/// A broken ledger invariant. Never returned, see [`invariant_violation`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("accounting invariant violated: {0}")]
pub struct InvariantViolation(pub String);

/// Logs the violation and stops the current thread of execution.
///
/// # Panics
///
/// Always.
#[track_caller]
pub fn invariant_violation(message: impl Into<String>) -> ! {
    let violation = InvariantViolation(message.into());
    tracing::error!("{violation}");
    panic!("{violation}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(AccountingError::InvalidQuota("q".into()).status_code(), 400);
        assert_eq!(AccountingError::KeyNotFound("w".into()).status_code(), 404);
        assert_eq!(
            AccountingError::Database(DbErr::Custom("down".into())).status_code(),
            503
        );
    }

    #[test]
    fn only_database_errors_are_retryable() {
        assert!(AccountingError::Database(DbErr::Custom("down".into())).is_retryable());
        assert!(!AccountingError::InvalidUsage("negative".into()).is_retryable());
    }

    #[test]
    #[should_panic(expected = "accounting invariant violated: negative quota")]
    fn invariant_violation_panics() {
        invariant_violation("negative quota");
    }
}
