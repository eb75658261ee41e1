//! Distributed transactions over independent stores.
//!
//! [`DistributedTransactionCoordinator`] runs two-phase commit across
//! registered [`ResourceParticipant`]s. Commit decisions are written to an
//! [`OutcomeLog`] before phase two so that
//! [`recover_pending_transactions`](DistributedTransactionCoordinator::recover_pending_transactions)
//! can finish what a crashed coordinator started.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use txcoord::distributed::{DistributedOperation, DistributedTransactionCoordinator};
//! use txcoord::store::{MemoryStore, RowKey, StoreConfig, StoreId, TableName};
//!
//! let orders = MemoryStore::with_config(StoreConfig::new(StoreId::new("orders").unwrap()));
//! let billing = MemoryStore::with_config(StoreConfig::new(StoreId::new("billing").unwrap()));
//!
//! let mut coordinator = DistributedTransactionCoordinator::default();
//! coordinator.register(Arc::new(orders.clone()));
//! coordinator.register(Arc::new(billing.clone()));
//!
//! let table = TableName::new("entries").unwrap();
//! let op = DistributedOperation::new()
//!     .participant(orders.store_id().clone())
//!     .participant(billing.store_id().clone())
//!     .step(orders.store_id().clone(), {
//!         let table = table.clone();
//!         move |conn| {
//!             let row = json!({ "total": 40 }).as_object().cloned().unwrap_or_default();
//!             conn.insert(&table, &RowKey::new("o-1").unwrap(), row)?;
//!             Ok(json!("order stored"))
//!         }
//!     });
//!
//! let result = coordinator.execute_distributed(op).unwrap();
//! assert!(result.successful);
//! ```

mod coordinator;
mod id;
mod operation;
mod outcome_log;
mod participant;

pub use coordinator::DistributedTransactionCoordinator;
pub use id::GlobalTransactionId;
pub use operation::{
    DistributedOperation, DistributedResult, GlobalOutcome, RecoveryResult, SubOperation,
};
pub use outcome_log::{
    CommitDecision, FileOutcomeLog, InMemoryOutcomeLog, OutcomeLog, OutcomeLogError,
};
pub use participant::{ResourceParticipant, Vote, XaResource};
