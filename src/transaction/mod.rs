//! Single-store transaction coordination.
//!
//! A unit of work is a closure over `&mut dyn Connection`. The
//! [`TransactionExecutor`] gives it a transaction boundary on a freshly
//! acquired connection; the [`DeadlockRetryCoordinator`] re-runs it when the
//! store reports a deadlock or serialization conflict.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 DeadlockRetryCoordinator                    │
//! │     (classifies failures, backs off, honours cancellation)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ each attempt
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TransactionExecutor                       │
//! │   (acquire, set level, commit or roll back, restore)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                     ConnectionFactory / Connection
//! ```
//!
//! # Usage
//!
//! ```
//! use txcoord::store::{MemoryStore, RowKey, TableName};
//! use txcoord::transaction::{
//!     DeadlockRetryCoordinator, IsolationLevel, RetryPolicy, TransactionExecutor,
//! };
//!
//! let store = MemoryStore::new();
//! let executor = TransactionExecutor::new(store.clone());
//! let table = TableName::new("accounts").unwrap();
//! let key = RowKey::new("1").unwrap();
//!
//! executor
//!     .run(IsolationLevel::ReadCommitted, |conn| {
//!         let row = serde_json::json!({ "balance": 100 });
//!         conn.insert(&table, &key, row.as_object().cloned().unwrap_or_default())?;
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! let coordinator = DeadlockRetryCoordinator::new(executor);
//! let balance = coordinator
//!     .run_with_retry(&RetryPolicy::default(), |conn| Ok(conn.get(&table, &key)?))
//!     .unwrap();
//! assert!(balance.is_some());
//! ```

mod error;
mod executor;
mod isolation;
mod ordering;
mod policy;
mod retry;

pub use error::{TransactionError, TransactionResult};
pub use executor::TransactionExecutor;
pub(crate) use executor::SessionGuard;
pub use isolation::IsolationLevel;
pub use ordering::lock_rows_in_order;
pub use policy::{PolicyError, RetryPolicy, RetryPolicyBuilder};
pub use retry::{
    AttemptOutcome, Backoff, CancellationToken, DeadlockRetryCoordinator, FailureClassifier,
    FailureKind, Pause, SqlStateClassifier, ThreadBackoff,
};
