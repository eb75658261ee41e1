//! In-memory multi-version store.
//!
//! Every committed write appends a version stamped with a global commit
//! sequence number. Uncommitted writes live in a per-row slot owned by the
//! writing transaction (the row lock guarantees at most one). What a read
//! returns depends on the reader's isolation level:
//!
//! | level            | source of a read                                   |
//! |------------------|----------------------------------------------------|
//! | READ UNCOMMITTED | any uncommitted slot, else latest committed        |
//! | READ COMMITTED   | latest committed                                   |
//! | REPEATABLE READ  | value pinned by the first read, else latest        |
//! | SERIALIZABLE     | version visible at the transaction's snapshot      |
//!
//! A transaction always sees its own uncommitted writes.
//!
//! Old versions are pruned when a row is committed: only the newest version
//! visible to the oldest open transaction's snapshot, and anything newer, is
//! kept.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::distributed::{GlobalTransactionId, Vote};
use crate::store::connection::MemoryConnection;
use crate::store::error::{StoreError, StoreResult};
use crate::store::locks::{LockManager, TxnId};
use crate::store::types::{Row, RowId, RowKey, StoreId, TableName};
use crate::transaction::IsolationLevel;

/// Store configuration options.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Identifier used when the store takes part in distributed work.
    pub store_id: StoreId,
    /// How long a statement waits for a row lock before failing.
    pub lock_wait_timeout: Duration,
    /// Isolation level of freshly opened connections.
    pub default_isolation: IsolationLevel,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_id: StoreId::default(),
            lock_wait_timeout: Duration::from_secs(5),
            default_isolation: IsolationLevel::default(),
        }
    }
}

impl StoreConfig {
    /// Create a new configuration for the given store id.
    pub fn new(store_id: StoreId) -> Self {
        Self {
            store_id,
            ..Default::default()
        }
    }

    /// Set the lock wait timeout.
    pub fn lock_wait_timeout(mut self, value: Duration) -> Self {
        self.lock_wait_timeout = value;
        self
    }

    /// Set the default isolation level.
    pub fn default_isolation(mut self, value: IsolationLevel) -> Self {
        self.default_isolation = value;
        self
    }
}

/// How a write treats an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    Insert,
    Upsert,
    Delete,
}

/// Distributed branch attached to an active transaction.
#[derive(Debug, Clone)]
pub(crate) struct Branch {
    pub xid: GlobalTransactionId,
    pub ended: bool,
}

/// Per-connection transaction state.
#[derive(Debug)]
pub(crate) struct ActiveTxn {
    pub id: TxnId,
    pub level: IsolationLevel,
    pub snapshot: u64,
    pub writes: BTreeSet<RowId>,
    pub pinned: HashMap<RowId, Option<Row>>,
    pub branch: Option<Branch>,
    pub rollback_only: bool,
}

#[derive(Debug, Clone)]
struct Version {
    seq: u64,
    row: Option<Row>,
}

#[derive(Debug)]
struct PreparedBranch {
    txn: TxnId,
    writes: BTreeSet<RowId>,
}

#[derive(Debug, Default)]
struct StoreState {
    committed: HashMap<RowId, Vec<Version>>,
    uncommitted: HashMap<RowId, (TxnId, Option<Row>)>,
    commit_seq: u64,
    next_txn: TxnId,
    prepared: HashMap<GlobalTransactionId, PreparedBranch>,
    /// Snapshot of every transaction that has begun and not yet finished.
    active: BTreeMap<TxnId, u64>,
}

impl StoreState {
    fn latest(&self, row: &RowId) -> Option<Row> {
        self.committed
            .get(row)
            .and_then(|versions| versions.last())
            .and_then(|v| v.row.clone())
    }

    fn latest_seq(&self, row: &RowId) -> u64 {
        self.committed
            .get(row)
            .and_then(|versions| versions.last())
            .map_or(0, |v| v.seq)
    }

    fn as_of(&self, row: &RowId, snapshot: u64) -> Option<Row> {
        self.committed
            .get(row)
            .and_then(|versions| versions.iter().rev().find(|v| v.seq <= snapshot))
            .and_then(|v| v.row.clone())
    }

    /// What `txn` sees for `row`, before repeatable-read pinning.
    fn visible(&self, txn: &ActiveTxn, row: &RowId) -> Option<Row> {
        if let Some((owner, value)) = self.uncommitted.get(row) {
            if *owner == txn.id || txn.level == IsolationLevel::ReadUncommitted {
                return value.clone();
            }
        }
        match txn.level {
            IsolationLevel::ReadUncommitted | IsolationLevel::ReadCommitted => self.latest(row),
            IsolationLevel::RepeatableRead => match txn.pinned.get(row) {
                Some(pinned) => pinned.clone(),
                None => self.latest(row),
            },
            IsolationLevel::Serializable => self.as_of(row, txn.snapshot),
        }
    }

    fn apply(&mut self, txn: TxnId, writes: &BTreeSet<RowId>) -> u64 {
        self.commit_seq += 1;
        let seq = self.commit_seq;
        let horizon = self.horizon();
        for row in writes {
            if let Some((owner, value)) = self.uncommitted.remove(row) {
                if owner == txn {
                    self.committed
                        .entry(row.clone())
                        .or_default()
                        .push(Version { seq, row: value });
                    self.prune(row, horizon);
                } else {
                    self.uncommitted.insert(row.clone(), (owner, value));
                }
            }
        }
        seq
    }

    /// Oldest snapshot any open transaction may still read from.
    fn horizon(&self) -> u64 {
        self.active
            .values()
            .copied()
            .min()
            .unwrap_or(self.commit_seq)
    }

    fn prune(&mut self, row: &RowId, horizon: u64) {
        let Some(versions) = self.committed.get_mut(row) else {
            return;
        };
        if let Some(oldest_needed) = versions.iter().rposition(|v| v.seq <= horizon) {
            versions.drain(..oldest_needed);
        }
        // A delete nobody can see past is the same as no row at all.
        if let [only] = versions.as_slice() {
            if only.row.is_none() && only.seq <= horizon {
                self.committed.remove(row);
            }
        }
    }

    fn finish(&mut self, txn: TxnId) {
        self.active.remove(&txn);
    }

    fn discard(&mut self, txn: TxnId, writes: &BTreeSet<RowId>) {
        for row in writes {
            if matches!(self.uncommitted.get(row), Some((owner, _)) if *owner == txn) {
                self.uncommitted.remove(row);
            }
        }
    }
}

pub(crate) struct StoreInner {
    config: StoreConfig,
    state: Mutex<StoreState>,
    locks: LockManager,
}

/// A transactional in-memory store.
///
/// Cheap to clone: every clone shares the same data, locks and prepared
/// branches.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    /// Create an empty store with default configuration.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create an empty store.
    pub fn with_config(config: StoreConfig) -> Self {
        let locks = LockManager::new(config.lock_wait_timeout);
        Self {
            inner: Arc::new(StoreInner {
                config,
                state: Mutex::new(StoreState::default()),
                locks,
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn store_id(&self) -> &StoreId {
        &self.inner.config.store_id
    }

    /// Open an unpooled connection.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection::new(self.clone(), self.inner.config.default_isolation, true)
    }

    /// Latest committed value of a row, outside of any transaction.
    pub fn committed_row(&self, table: &TableName, key: &RowKey) -> Option<Row> {
        let row = RowId::new(table.clone(), key.clone());
        self.inner.state.lock().latest(&row)
    }

    /// Number of branches parked in the prepared state.
    pub fn prepared_count(&self) -> usize {
        self.inner.state.lock().prepared.len()
    }

    /// Transaction currently holding the lock on a row.
    pub fn lock_owner(&self, table: &TableName, key: &RowKey) -> Option<TxnId> {
        self.inner.locks.owner(&RowId::new(table.clone(), key.clone()))
    }

    pub(crate) fn begin(&self, level: IsolationLevel) -> ActiveTxn {
        let mut state = self.inner.state.lock();
        state.next_txn += 1;
        let (id, snapshot) = (state.next_txn, state.commit_seq);
        state.active.insert(id, snapshot);
        let txn = ActiveTxn {
            id,
            level,
            snapshot,
            writes: BTreeSet::new(),
            pinned: HashMap::new(),
            branch: None,
            rollback_only: false,
        };
        debug!(txn = txn.id, level = %level, snapshot = txn.snapshot, "begin");
        txn
    }

    pub(crate) fn read(&self, txn: &mut ActiveTxn, row: &RowId) -> Option<Row> {
        let state = self.inner.state.lock();
        let value = state.visible(txn, row);
        if txn.level == IsolationLevel::RepeatableRead && !txn.writes.contains(row) {
            txn.pinned.entry(row.clone()).or_insert_with(|| value.clone());
        }
        value
    }

    pub(crate) fn scan(
        &self,
        txn: &mut ActiveTxn,
        table: &TableName,
        filter: &dyn Fn(&Row) -> bool,
    ) -> Vec<(RowKey, Row)> {
        let state = self.inner.state.lock();
        let candidates: BTreeSet<&RowId> = state
            .committed
            .keys()
            .chain(state.uncommitted.keys())
            .filter(|row| &row.table == table)
            .collect();

        let mut rows = Vec::new();
        for row in candidates {
            let value = state.visible(txn, row);
            if txn.level == IsolationLevel::RepeatableRead && !txn.writes.contains(row) {
                txn.pinned.entry(row.clone()).or_insert_with(|| value.clone());
            }
            if let Some(value) = value {
                if filter(&value) {
                    rows.push((row.key.clone(), value));
                }
            }
        }
        rows
    }

    pub(crate) fn lock(&self, txn: &ActiveTxn, row: &RowId) -> StoreResult<()> {
        self.inner.locks.acquire(txn.id, row)
    }

    /// Stage a write. Returns whether the row existed before the write.
    pub(crate) fn write(
        &self,
        txn: &mut ActiveTxn,
        row: &RowId,
        value: Option<Row>,
        mode: WriteMode,
    ) -> StoreResult<bool> {
        self.inner.locks.acquire(txn.id, row)?;

        let mut state = self.inner.state.lock();
        if txn.level.first_updater_wins() && state.latest_seq(row) > txn.snapshot {
            return Err(StoreError::SerializationFailure {
                table: row.table.clone(),
                key: row.key.clone(),
            });
        }

        let existed = match state.uncommitted.get(row) {
            Some((owner, value)) if *owner == txn.id => value.is_some(),
            _ => state.latest(row).is_some(),
        };
        if mode == WriteMode::Insert && existed {
            return Err(StoreError::UniqueViolation {
                table: row.table.clone(),
                key: row.key.clone(),
            });
        }

        state.uncommitted.insert(row.clone(), (txn.id, value));
        txn.writes.insert(row.clone());
        Ok(existed)
    }

    pub(crate) fn commit(&self, txn: ActiveTxn) {
        let seq = {
            let mut state = self.inner.state.lock();
            state.finish(txn.id);
            state.apply(txn.id, &txn.writes)
        };
        self.inner.locks.release_all(txn.id);
        debug!(txn = txn.id, seq, writes = txn.writes.len(), "commit");
    }

    pub(crate) fn rollback(&self, txn: ActiveTxn) {
        {
            let mut state = self.inner.state.lock();
            state.finish(txn.id);
            state.discard(txn.id, &txn.writes);
        }
        self.inner.locks.release_all(txn.id);
        debug!(txn = txn.id, "rollback");
    }

    /// Phase one for a branch: park the write set (keeping its locks) or
    /// finish the branch right away when there is nothing to commit.
    pub(crate) fn prepare(&self, txn: ActiveTxn, xid: GlobalTransactionId) -> Vote {
        if txn.rollback_only {
            self.rollback(txn);
            return Vote::Rollback;
        }
        if txn.writes.is_empty() {
            self.inner.state.lock().finish(txn.id);
            self.inner.locks.release_all(txn.id);
            return Vote::ReadOnly;
        }

        debug!(txn = txn.id, xid = %xid, "prepared");
        let mut state = self.inner.state.lock();
        // A prepared branch no longer reads, so its snapshot can go.
        state.finish(txn.id);
        state.prepared.insert(
            xid,
            PreparedBranch {
                txn: txn.id,
                writes: txn.writes,
            },
        );
        Vote::Commit
    }

    pub(crate) fn commit_prepared(&self, xid: &GlobalTransactionId) -> StoreResult<()> {
        let mut state = self.inner.state.lock();
        let branch = state
            .prepared
            .remove(xid)
            .ok_or_else(|| StoreError::UnknownBranch(xid.to_string()))?;
        state.apply(branch.txn, &branch.writes);
        drop(state);
        self.inner.locks.release_all(branch.txn);
        Ok(())
    }

    pub(crate) fn rollback_prepared(&self, xid: &GlobalTransactionId) -> StoreResult<()> {
        let mut state = self.inner.state.lock();
        let branch = state
            .prepared
            .remove(xid)
            .ok_or_else(|| StoreError::UnknownBranch(xid.to_string()))?;
        state.discard(branch.txn, &branch.writes);
        drop(state);
        self.inner.locks.release_all(branch.txn);
        Ok(())
    }

    pub(crate) fn prepared_branches(&self) -> Vec<GlobalTransactionId> {
        let mut xids: Vec<_> = self.inner.state.lock().prepared.keys().copied().collect();
        xids.sort();
        xids
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("store_id", &self.inner.config.store_id)
            .field("prepared", &self.prepared_count())
            .finish()
    }
}
