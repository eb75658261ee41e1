//! Store boundary and in-memory reference store.
//!
//! The coordination layer only ever talks to a store through the
//! [`Connection`] / [`ConnectionFactory`] traits (and, for distributed work,
//! [`crate::distributed::ResourceParticipant`]). [`MemoryStore`] implements all
//! of them with real locking and multi-version isolation so the coordinators
//! can be exercised without an external database.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │          ConnectionPool / MemoryStore (factories)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │ Connection  │       │ LockManager │       │ XA branches │
//!  │ (statements)│       │ (deadlocks) │       │ (prepared)  │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//!         │                     │                     │
//!         └─────────────────────┼─────────────────────┘
//!                               ▼
//!                     ┌───────────────────┐
//!                     │ versioned rows    │
//!                     │ + uncommitted     │
//!                     └───────────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use txcoord::store::{Connection, MemoryStore, RowKey, TableName};
//!
//! let store = MemoryStore::new();
//! let mut conn = store.connect();
//! let table = TableName::new("accounts").unwrap();
//! let key = RowKey::new("1").unwrap();
//!
//! let row = serde_json::json!({ "balance": 1000 }).as_object().cloned().unwrap();
//! conn.insert(&table, &key, row).unwrap();
//! assert!(conn.get(&table, &key).unwrap().is_some());
//! ```

mod connection;
mod error;
mod locks;
mod memory;
mod types;
mod xa;

pub use connection::{Connection, ConnectionFactory, ConnectionPool, MemoryConnection, PoolConfig};
pub use error::{StoreError, StoreResult};
pub use locks::TxnId;
pub use memory::{MemoryStore, StoreConfig};
pub use types::{InvalidNameError, Row, RowId, RowKey, StoreId, TableName};
pub use xa::MemoryXaResource;
