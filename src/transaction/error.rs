//! Transaction error types.

use thiserror::Error;

use crate::distributed::OutcomeLogError;
use crate::store::{StoreError, StoreId};
use crate::transaction::policy::PolicyError;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors that can occur while coordinating transactions.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Store layer error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The unit of work gave up on its own (business rule, validation).
    #[error("operation aborted: {0}")]
    Aborted(String),

    /// Every attempt allowed by the retry policy hit a retryable failure.
    #[error("transaction failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<TransactionError>,
    },

    /// The retry loop was cancelled while waiting to retry.
    #[error("transaction retry interrupted after {attempts} attempts")]
    Interrupted { attempts: u32 },

    /// Invalid retry policy.
    #[error("invalid retry policy: {0}")]
    Policy(#[from] PolicyError),

    /// Isolation level that could not be parsed or is not supported.
    #[error("invalid isolation level: {0}")]
    InvalidIsolationLevel(String),

    /// A distributed operation referenced a store that is not registered or
    /// not listed as a participant.
    #[error("unknown participant: {0}")]
    UnknownParticipant(StoreId),

    /// A participant could not be reached at all.
    #[error("participant {store} unavailable: {source}")]
    ParticipantUnavailable {
        store: StoreId,
        #[source]
        source: StoreError,
    },

    /// The durable decision log failed.
    #[error("outcome log error: {0}")]
    OutcomeLog(#[from] OutcomeLogError),

    /// Internal error.
    #[error("internal transaction error: {0}")]
    Internal(String),
}

impl TransactionError {
    /// Create an application-level abort.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted(reason.into())
    }

    /// The store error at the root of this error, looking through retry
    /// wrappers.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            TransactionError::Store(err) => Some(err),
            TransactionError::ParticipantUnavailable { source, .. } => Some(source),
            TransactionError::RetriesExhausted { last, .. } => last.store_error(),
            _ => None,
        }
    }

    /// SQLSTATE-style code of the underlying store error, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        self.store_error().map(StoreError::sqlstate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RowKey, TableName};

    fn deadlock() -> StoreError {
        StoreError::Deadlock {
            txn: 3,
            table: TableName::new("accounts").unwrap(),
            key: RowKey::new("1").unwrap(),
        }
    }

    #[test]
    fn test_store_error_through_wrappers() {
        let err = TransactionError::RetriesExhausted {
            attempts: 3,
            last: Box::new(TransactionError::from(deadlock())),
        };
        assert_eq!(err.sqlstate(), Some("40P01"));
        assert!(err.to_string().contains("after 3 attempts"));

        assert_eq!(TransactionError::aborted("insufficient funds").sqlstate(), None);
    }

    #[test]
    fn test_exhausted_error_exposes_source() {
        use std::error::Error;

        let err = TransactionError::RetriesExhausted {
            attempts: 2,
            last: Box::new(TransactionError::from(deadlock())),
        };
        let source = err.source().unwrap();
        assert!(source.to_string().contains("deadlock detected"));
    }
}
