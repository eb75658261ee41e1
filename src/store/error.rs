//! Store layer error types
//!
//! Every error a store adapter can raise is defined here. Each variant maps to
//! a SQLSTATE-style code so callers (and the retry classifier) can tell a
//! deadlock from a constraint violation without parsing messages.

use std::time::Duration;

use thiserror::Error;

use crate::store::types::{InvalidNameError, RowKey, TableName};

/// the main error type for store operations
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// the store broke a lock cycle by aborting this transaction
    #[error("deadlock detected: transaction {txn} waiting for {table}/{key}")]
    Deadlock {
        txn: u64,
        table: TableName,
        key: RowKey,
    },

    /// first-updater-wins conflict under snapshot isolation
    #[error("could not serialize access due to concurrent update of {table}/{key}")]
    SerializationFailure { table: TableName, key: RowKey },

    /// waited too long for a row lock
    #[error("lock wait timeout exceeded on {table}/{key} after {waited:?}")]
    LockTimeout {
        table: TableName,
        key: RowKey,
        waited: Duration,
    },

    /// duplicate primary key
    #[error("duplicate key value violates unique constraint: {table}/{key}")]
    UniqueViolation { table: TableName, key: RowKey },

    /// invalid table or key name
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// operation not allowed in the current transaction state
    #[error("invalid transaction state: {0}")]
    InvalidState(String),

    /// the handle was closed or its store went away
    #[error("connection closed")]
    ConnectionClosed,

    /// no pooled connection became free in time
    #[error("connection pool exhausted after waiting {0:?}")]
    PoolExhausted(Duration),

    /// XAER_NOTA: the branch is not known to this resource
    #[error("unknown transaction branch: {0}")]
    UnknownBranch(String),

    /// XAER_PROTO: branch operations called out of order
    #[error("xa protocol error: {0}")]
    XaProtocol(String),

    /// error surfaced verbatim from a foreign driver
    #[error("{message} (sqlstate {sqlstate})")]
    Driver { sqlstate: String, message: String },
}

impl StoreError {
    /// SQLSTATE-style code for this error.
    pub fn sqlstate(&self) -> &str {
        match self {
            StoreError::Deadlock { .. } => "40P01",
            StoreError::SerializationFailure { .. } => "40001",
            StoreError::LockTimeout { .. } => "55P03",
            StoreError::UniqueViolation { .. } => "23505",
            StoreError::InvalidName(_) => "42602",
            StoreError::InvalidState(_) => "25000",
            StoreError::ConnectionClosed => "08003",
            StoreError::PoolExhausted(_) => "53300",
            StoreError::UnknownBranch(_) => "XAE04",
            StoreError::XaProtocol(_) => "XAE05",
            StoreError::Driver { sqlstate, .. } => sqlstate,
        }
    }

    /// check if this error is a constraint violation
    pub fn is_constraint_violation(&self) -> bool {
        self.sqlstate().starts_with("23")
    }

    /// check if this error means the connection itself is unusable
    pub fn is_connection_failure(&self) -> bool {
        self.sqlstate().starts_with("08")
    }
}

/// result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_codes() {
        let table = TableName::new("accounts").unwrap();
        let key = RowKey::new("1").unwrap();

        let deadlock = StoreError::Deadlock {
            txn: 7,
            table: table.clone(),
            key: key.clone(),
        };
        assert_eq!(deadlock.sqlstate(), "40P01");
        assert!(deadlock.to_string().contains("deadlock"));

        let dup = StoreError::UniqueViolation { table, key };
        assert!(dup.is_constraint_violation());
        assert!(!dup.is_connection_failure());

        assert!(StoreError::ConnectionClosed.is_connection_failure());
    }

    #[test]
    fn test_driver_error_keeps_foreign_code() {
        let err = StoreError::Driver {
            sqlstate: "HY000".into(),
            message: "Lock wait timeout exceeded; try restarting transaction".into(),
        };
        assert_eq!(err.sqlstate(), "HY000");
        assert!(err.to_string().starts_with("Lock wait timeout"));
    }
}
