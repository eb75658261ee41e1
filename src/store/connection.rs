//! Connection handles and pooling.
//!
//! [`Connection`] is the transactional handle every unit of work receives.
//! [`ConnectionFactory`] hands out exclusively owned handles that release
//! themselves when dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::store::error::{StoreError, StoreResult};
use crate::store::memory::{ActiveTxn, MemoryStore, WriteMode};
use crate::store::types::{Row, RowId, RowKey, TableName};
use crate::transaction::IsolationLevel;

/// A live, exclusively owned transactional handle.
pub trait Connection: Send {
    /// Isolation level applied to the next transaction.
    fn isolation_level(&self) -> IsolationLevel;

    /// Change the isolation level. Fails inside an open transaction.
    fn set_isolation_level(&mut self, level: IsolationLevel) -> StoreResult<()>;

    /// Whether every statement commits on its own.
    fn auto_commit(&self) -> bool;

    /// Toggle auto-commit. Enabling it commits an open transaction.
    fn set_auto_commit(&mut self, enabled: bool) -> StoreResult<()>;

    /// Commit the open transaction, if any.
    fn commit(&mut self) -> StoreResult<()>;

    /// Roll back the open transaction, if any.
    fn rollback(&mut self) -> StoreResult<()>;

    /// Read one row.
    fn get(&mut self, table: &TableName, key: &RowKey) -> StoreResult<Option<Row>>;

    /// Insert a new row; fails with a unique violation if the key exists.
    fn insert(&mut self, table: &TableName, key: &RowKey, row: Row) -> StoreResult<()>;

    /// Insert or replace a row.
    fn upsert(&mut self, table: &TableName, key: &RowKey, row: Row) -> StoreResult<()>;

    /// Delete a row. Returns whether it existed.
    fn delete(&mut self, table: &TableName, key: &RowKey) -> StoreResult<bool>;

    /// Take the row's write lock without changing it (`SELECT ... FOR UPDATE`).
    fn lock_row(&mut self, table: &TableName, key: &RowKey) -> StoreResult<()>;

    /// Read every row of `table` matching `filter`, ordered by key.
    fn scan(
        &mut self,
        table: &TableName,
        filter: &dyn Fn(&Row) -> bool,
    ) -> StoreResult<Vec<(RowKey, Row)>>;
}

/// Source of connection handles.
pub trait ConnectionFactory: Send + Sync {
    type Conn: Connection;

    /// Acquire a handle. It is released when dropped.
    fn acquire(&self) -> StoreResult<Self::Conn>;
}

/// Session settings that survive a trip through the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SessionSettings {
    isolation: IsolationLevel,
    auto_commit: bool,
}

/// A connection to a [`MemoryStore`].
pub struct MemoryConnection {
    pub(crate) store: MemoryStore,
    pub(crate) isolation: IsolationLevel,
    pub(crate) auto_commit: bool,
    pub(crate) txn: Option<ActiveTxn>,
    pool: Option<Arc<PoolInner>>,
}

impl MemoryConnection {
    pub(crate) fn new(store: MemoryStore, isolation: IsolationLevel, auto_commit: bool) -> Self {
        Self {
            store,
            isolation,
            auto_commit,
            txn: None,
            pool: None,
        }
    }

    /// Whether a transaction is open on this connection.
    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Run one statement, beginning a transaction lazily. In auto-commit
    /// mode the statement's transaction ends with it; otherwise a failed
    /// statement leaves the transaction rollback-only.
    pub(crate) fn statement<T>(
        &mut self,
        f: impl FnOnce(&MemoryStore, &mut ActiveTxn) -> StoreResult<T>,
    ) -> StoreResult<T> {
        if let Some(txn) = &self.txn {
            if txn.rollback_only {
                return Err(StoreError::InvalidState(
                    "current transaction is aborted, commands ignored until rollback".into(),
                ));
            }
            if txn.branch.as_ref().is_some_and(|b| b.ended) {
                return Err(StoreError::XaProtocol(
                    "statement issued after the branch was ended".into(),
                ));
            }
        }

        let store = &self.store;
        let isolation = self.isolation;
        let txn = self.txn.get_or_insert_with(|| store.begin(isolation));
        let result = f(store, txn);

        if self.auto_commit {
            if let Some(txn) = self.txn.take() {
                if result.is_ok() {
                    self.store.commit(txn);
                } else {
                    self.store.rollback(txn);
                }
            }
        } else if result.is_err() {
            txn.rollback_only = true;
        }
        result
    }

    fn ensure_local(&self, action: &str) -> StoreResult<()> {
        match self.txn.as_ref().and_then(|txn| txn.branch.as_ref()) {
            Some(branch) => Err(StoreError::XaProtocol(format!(
                "{action} not allowed inside distributed branch {}",
                branch.xid
            ))),
            None => Ok(()),
        }
    }
}

impl Connection for MemoryConnection {
    fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    fn set_isolation_level(&mut self, level: IsolationLevel) -> StoreResult<()> {
        if self.txn.is_some() && level != self.isolation {
            return Err(StoreError::InvalidState(
                "isolation level cannot change inside an open transaction".into(),
            ));
        }
        self.isolation = level;
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    fn set_auto_commit(&mut self, enabled: bool) -> StoreResult<()> {
        if enabled && !self.auto_commit {
            self.commit()?;
        }
        self.auto_commit = enabled;
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        self.ensure_local("commit")?;
        let Some(txn) = self.txn.take() else {
            return Ok(());
        };
        if txn.rollback_only {
            self.store.rollback(txn);
            return Err(StoreError::InvalidState(
                "transaction was aborted by an earlier error and has been rolled back".into(),
            ));
        }
        self.store.commit(txn);
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        self.ensure_local("rollback")?;
        if let Some(txn) = self.txn.take() {
            self.store.rollback(txn);
        }
        Ok(())
    }

    fn get(&mut self, table: &TableName, key: &RowKey) -> StoreResult<Option<Row>> {
        let row = RowId::new(table.clone(), key.clone());
        self.statement(|store, txn| Ok(store.read(txn, &row)))
    }

    fn insert(&mut self, table: &TableName, key: &RowKey, value: Row) -> StoreResult<()> {
        let row = RowId::new(table.clone(), key.clone());
        self.statement(|store, txn| {
            store
                .write(txn, &row, Some(value), WriteMode::Insert)
                .map(|_| ())
        })
    }

    fn upsert(&mut self, table: &TableName, key: &RowKey, value: Row) -> StoreResult<()> {
        let row = RowId::new(table.clone(), key.clone());
        self.statement(|store, txn| {
            store
                .write(txn, &row, Some(value), WriteMode::Upsert)
                .map(|_| ())
        })
    }

    fn delete(&mut self, table: &TableName, key: &RowKey) -> StoreResult<bool> {
        let row = RowId::new(table.clone(), key.clone());
        self.statement(|store, txn| store.write(txn, &row, None, WriteMode::Delete))
    }

    fn lock_row(&mut self, table: &TableName, key: &RowKey) -> StoreResult<()> {
        let row = RowId::new(table.clone(), key.clone());
        self.statement(|store, txn| store.lock(txn, &row))
    }

    fn scan(
        &mut self,
        table: &TableName,
        filter: &dyn Fn(&Row) -> bool,
    ) -> StoreResult<Vec<(RowKey, Row)>> {
        self.statement(|store, txn| Ok(store.scan(txn, table, filter)))
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            if txn.branch.is_none() {
                warn!(txn = txn.id, "connection dropped with an open transaction, rolling back");
            }
            self.store.rollback(txn);
        }

        // Return the slot and its session settings to the pool if pooled.
        if let Some(pool) = self.pool.take() {
            pool.release(SessionSettings {
                isolation: self.isolation,
                auto_commit: self.auto_commit,
            });
        }
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("isolation", &self.isolation)
            .field("auto_commit", &self.auto_commit)
            .field("in_transaction", &self.txn.is_some())
            .finish()
    }
}

impl ConnectionFactory for MemoryStore {
    type Conn = MemoryConnection;

    fn acquire(&self) -> StoreResult<MemoryConnection> {
        Ok(self.connect())
    }
}

/// Pool configuration options.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections checked out at once.
    pub max_connections: usize,
    /// How long `get` waits for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Set the maximum number of connections.
    pub fn max_connections(mut self, value: usize) -> Self {
        self.max_connections = value;
        self
    }

    /// Set the acquire timeout.
    pub fn acquire_timeout(mut self, value: Duration) -> Self {
        self.acquire_timeout = value;
        self
    }
}

#[derive(Debug)]
struct PoolState {
    idle: Vec<SessionSettings>,
    created: usize,
    in_use: usize,
}

#[derive(Debug)]
struct PoolInner {
    store: MemoryStore,
    config: PoolConfig,
    state: Mutex<PoolState>,
    returned: Condvar,
}

impl PoolInner {
    fn release(&self, settings: SessionSettings) {
        let mut state = self.state.lock();
        state.in_use -= 1;
        state.idle.push(settings);
        drop(state);
        self.returned.notify_one();
    }
}

/// Connection pool over a [`MemoryStore`].
///
/// Idle connections keep their session settings, like pooled driver
/// connections do, so a caller that changes them must put them back. The
/// most recently returned connection is handed out first.
#[derive(Clone, Debug)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a new connection pool.
    pub fn new(store: MemoryStore, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                store,
                config,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    created: 0,
                    in_use: 0,
                }),
                returned: Condvar::new(),
            }),
        }
    }

    /// Get a connection from the pool, waiting up to the acquire timeout.
    pub fn get(&self) -> StoreResult<MemoryConnection> {
        let timeout = self.inner.config.acquire_timeout;
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();

        loop {
            if let Some(settings) = state.idle.pop() {
                state.in_use += 1;
                return Ok(self.checkout(settings));
            }

            if state.created < self.inner.config.max_connections {
                state.created += 1;
                state.in_use += 1;
                let defaults = SessionSettings {
                    isolation: self.inner.store.config().default_isolation,
                    auto_commit: true,
                };
                return Ok(self.checkout(defaults));
            }

            if self.inner.returned.wait_until(&mut state, deadline).timed_out()
                && state.idle.is_empty()
            {
                return Err(StoreError::PoolExhausted(timeout));
            }
        }
    }

    fn checkout(&self, settings: SessionSettings) -> MemoryConnection {
        let mut conn = MemoryConnection::new(
            self.inner.store.clone(),
            settings.isolation,
            settings.auto_commit,
        );
        conn.pool = Some(Arc::clone(&self.inner));
        conn
    }

    /// Get the number of idle connections.
    pub fn available(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Get the total number of connections created.
    pub fn created(&self) -> usize {
        self.inner.state.lock().created
    }

    /// Get the number of connections currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.state.lock().in_use
    }

    pub fn store(&self) -> &MemoryStore {
        &self.inner.store
    }
}

impl ConnectionFactory for ConnectionPool {
    type Conn = MemoryConnection;

    fn acquire(&self) -> StoreResult<MemoryConnection> {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    fn table() -> TableName {
        TableName::new("items").unwrap()
    }

    fn key(k: &str) -> RowKey {
        RowKey::new(k).unwrap()
    }

    fn row(value: i64) -> Row {
        json!({ "value": value }).as_object().cloned().unwrap()
    }

    #[test]
    fn test_auto_commit_statements() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        assert!(conn.auto_commit());

        conn.insert(&table(), &key("a"), row(1)).unwrap();
        assert!(!conn.in_transaction());
        assert_eq!(store.committed_row(&table(), &key("a")), Some(row(1)));

        assert!(conn.insert(&table(), &key("a"), row(2)).is_err());
        assert!(!conn.in_transaction());
        assert_eq!(store.committed_row(&table(), &key("a")), Some(row(1)));
    }

    #[test]
    fn test_explicit_transaction() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        conn.set_auto_commit(false).unwrap();

        conn.upsert(&table(), &key("a"), row(1)).unwrap();
        assert!(conn.in_transaction());
        assert_eq!(store.committed_row(&table(), &key("a")), None);

        conn.commit().unwrap();
        assert!(!conn.in_transaction());
        assert_eq!(store.committed_row(&table(), &key("a")), Some(row(1)));

        assert!(conn.delete(&table(), &key("a")).unwrap());
        conn.rollback().unwrap();
        assert_eq!(store.committed_row(&table(), &key("a")), Some(row(1)));
    }

    #[test]
    fn test_failed_statement_aborts_transaction() {
        let store = MemoryStore::new();
        store.connect().insert(&table(), &key("a"), row(1)).unwrap();

        let mut conn = store.connect();
        conn.set_auto_commit(false).unwrap();
        conn.upsert(&table(), &key("b"), row(2)).unwrap();
        assert!(conn.insert(&table(), &key("a"), row(3)).is_err());

        let err = conn.get(&table(), &key("b")).unwrap_err();
        assert_eq!(err.sqlstate(), "25000");

        assert!(conn.commit().is_err());
        assert_eq!(store.committed_row(&table(), &key("b")), None);
        assert!(!conn.in_transaction());
    }

    #[test]
    fn test_isolation_change_inside_transaction_fails() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        conn.set_auto_commit(false).unwrap();
        conn.get(&table(), &key("a")).unwrap();

        assert!(conn.set_isolation_level(IsolationLevel::Serializable).is_err());
        conn.rollback().unwrap();
        conn.set_isolation_level(IsolationLevel::Serializable).unwrap();
        assert_eq!(conn.isolation_level(), IsolationLevel::Serializable);
    }

    #[test]
    fn test_enabling_auto_commit_commits() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        conn.set_auto_commit(false).unwrap();
        conn.upsert(&table(), &key("a"), row(1)).unwrap();

        conn.set_auto_commit(true).unwrap();
        assert_eq!(store.committed_row(&table(), &key("a")), Some(row(1)));
    }

    #[test]
    fn test_drop_rolls_back_and_releases_locks() {
        let store = MemoryStore::new();
        {
            let mut conn = store.connect();
            conn.set_auto_commit(false).unwrap();
            conn.upsert(&table(), &key("a"), row(1)).unwrap();
            assert!(store.lock_owner(&table(), &key("a")).is_some());
        }
        assert_eq!(store.lock_owner(&table(), &key("a")), None);
        assert_eq!(store.committed_row(&table(), &key("a")), None);
    }

    #[test]
    fn test_scan_with_filter() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        for (k, v) in [("a", 1), ("b", 20), ("c", 30)] {
            conn.upsert(&table(), &key(k), row(v)).unwrap();
        }

        let big = conn
            .scan(&table(), &|r| r["value"].as_i64().unwrap_or(0) >= 20)
            .unwrap();
        let keys: Vec<&str> = big.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn test_connection_pool() {
        let pool = ConnectionPool::new(MemoryStore::new(), PoolConfig::default().max_connections(5));

        let mut conn = pool.get().unwrap();
        conn.upsert(&table(), &key("a"), row(1)).unwrap();

        assert_eq!(pool.created(), 1);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn test_pool_reuse_keeps_session_settings() {
        let pool = ConnectionPool::new(MemoryStore::new(), PoolConfig::default().max_connections(5));

        let mut conn1 = pool.get().unwrap();
        let conn2 = pool.get().unwrap();
        conn1.set_isolation_level(IsolationLevel::Serializable).unwrap();
        assert_eq!(pool.created(), 2);

        drop(conn2);
        drop(conn1);
        assert_eq!(pool.available(), 2);

        // Last returned, first handed out.
        let conn3 = pool.get().unwrap();
        assert_eq!(pool.created(), 2);
        assert_eq!(conn3.isolation_level(), IsolationLevel::Serializable);

        let conn4 = pool.get().unwrap();
        assert_eq!(conn4.isolation_level(), IsolationLevel::default());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = ConnectionPool::new(
            MemoryStore::new(),
            PoolConfig::default()
                .max_connections(1)
                .acquire_timeout(Duration::from_millis(20)),
        );

        let held = pool.get().unwrap();
        let err = pool.get().unwrap_err();
        assert!(matches!(err, StoreError::PoolExhausted(_)));
        assert_eq!(err.sqlstate(), "53300");

        drop(held);
        assert!(pool.get().is_ok());
    }

    #[test]
    fn test_pool_waiter_gets_returned_connection() {
        let pool = ConnectionPool::new(
            MemoryStore::new(),
            PoolConfig::default()
                .max_connections(1)
                .acquire_timeout(Duration::from_secs(5)),
        );

        let held = pool.get().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.get().map(|_| ()))
        };

        thread::sleep(Duration::from_millis(20));
        drop(held);
        waiter.join().unwrap().unwrap();
        assert_eq!(pool.created(), 1);
    }
}
