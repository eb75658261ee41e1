//! Row lock manager with wait-for graph deadlock detection.
//!
//! Locks are exclusive and owned by a transaction id, so a prepared branch
//! keeps its locks after the connection that created it is gone. A waiter
//! records one wait-for edge (to the current owner). Before blocking, the
//! requester follows the edge chain; if it leads back to itself the requester
//! is aborted with a deadlock error.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::store::error::{StoreError, StoreResult};
use crate::store::types::RowId;

/// Store-assigned transaction identifier.
pub type TxnId = u64;

#[derive(Debug, Default)]
struct LockTable {
    owners: HashMap<RowId, TxnId>,
    waits_for: HashMap<TxnId, TxnId>,
}

impl LockTable {
    /// Follow wait-for edges starting at `txn` and report whether they loop
    /// back to it.
    fn closes_cycle(&self, txn: TxnId) -> bool {
        let mut seen = HashSet::new();
        let mut current = txn;
        while let Some(&next) = self.waits_for.get(&current) {
            if next == txn {
                return true;
            }
            if !seen.insert(next) {
                return false;
            }
            current = next;
        }
        false
    }
}

/// Exclusive row locks shared by every connection of one store.
#[derive(Debug)]
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    wait_timeout: Duration,
}

impl LockManager {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            wait_timeout,
        }
    }

    /// Acquire the lock on `row` for `txn`, blocking while another
    /// transaction holds it. Re-acquiring an owned lock is a no-op.
    pub fn acquire(&self, txn: TxnId, row: &RowId) -> StoreResult<()> {
        let started = Instant::now();
        let deadline = started + self.wait_timeout;
        let mut table = self.table.lock();

        loop {
            let owner = match table.owners.get(row) {
                None => {
                    table.owners.insert(row.clone(), txn);
                    table.waits_for.remove(&txn);
                    return Ok(());
                }
                Some(&owner) if owner == txn => {
                    table.waits_for.remove(&txn);
                    return Ok(());
                }
                Some(&owner) => owner,
            };

            table.waits_for.insert(txn, owner);
            if table.closes_cycle(txn) {
                table.waits_for.remove(&txn);
                debug!(txn, owner, row = %row, "deadlock detected, aborting requester");
                return Err(StoreError::Deadlock {
                    txn,
                    table: row.table.clone(),
                    key: row.key.clone(),
                });
            }

            if Instant::now() >= deadline {
                table.waits_for.remove(&txn);
                return Err(StoreError::LockTimeout {
                    table: row.table.clone(),
                    key: row.key.clone(),
                    waited: started.elapsed(),
                });
            }

            debug!(txn, owner, row = %row, "waiting for row lock");
            let _ = self.released.wait_until(&mut table, deadline);
        }
    }

    /// Release every lock held by `txn` and wake all waiters.
    pub fn release_all(&self, txn: TxnId) {
        let mut table = self.table.lock();
        table.owners.retain(|_, owner| *owner != txn);
        table.waits_for.remove(&txn);
        drop(table);
        self.released.notify_all();
    }

    /// Current owner of the lock on `row`, if any.
    pub fn owner(&self, row: &RowId) -> Option<TxnId> {
        self.table.lock().owners.get(row).copied()
    }

    /// Number of locks currently held by `txn`.
    pub fn held_by(&self, txn: TxnId) -> usize {
        self.table
            .lock()
            .owners
            .values()
            .filter(|owner| **owner == txn)
            .count()
    }
}
