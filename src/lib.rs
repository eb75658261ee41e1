//! txcoord - transaction coordination over transactional stores
//!
//! The crate sits above any store that hands out transactional connections
//! and provides:
//!
//! - [`transaction::TransactionExecutor`]: runs a unit of work in one
//!   transaction at a chosen isolation level, committing or rolling back and
//!   restoring the connection's session settings.
//! - [`transaction::DeadlockRetryCoordinator`]: retries units of work that
//!   lose a deadlock or serialization conflict, with geometric backoff.
//! - [`anomaly::IsolationAnomalyTester`]: measures which read anomalies a
//!   store lets through at each isolation level.
//! - [`distributed::DistributedTransactionCoordinator`]: two-phase commit
//!   across independent stores, with a durable decision log and recovery.
//!
//! [`store::MemoryStore`] is a complete in-memory store with row locks,
//! deadlock detection, multi-version isolation and prepared branches.
//!
//! # Example
//!
//! ```
//! use txcoord::store::{MemoryStore, RowKey, TableName};
//! use txcoord::transaction::{
//!     DeadlockRetryCoordinator, IsolationLevel, RetryPolicy, TransactionExecutor,
//! };
//!
//! let store = MemoryStore::new();
//! let coordinator = DeadlockRetryCoordinator::new(TransactionExecutor::new(store.clone()))
//!     .with_isolation(IsolationLevel::RepeatableRead);
//!
//! let table = TableName::new("counters").unwrap();
//! let key = RowKey::new("hits").unwrap();
//! coordinator
//!     .run_with_retry(&RetryPolicy::default(), |conn| {
//!         let row = serde_json::json!({ "value": 1 });
//!         conn.upsert(&table, &key, row.as_object().cloned().unwrap_or_default())?;
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! assert!(store.committed_row(&table, &key).is_some());
//! ```

pub mod anomaly;
pub mod config;
pub mod distributed;
pub mod store;
pub mod transaction;
