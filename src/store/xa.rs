//! Distributed branch support for the in-memory store.

use tracing::debug;

use crate::distributed::{GlobalTransactionId, ResourceParticipant, Vote, XaResource};
use crate::store::connection::{Connection, MemoryConnection};
use crate::store::error::{StoreError, StoreResult};
use crate::store::memory::{Branch, MemoryStore};
use crate::store::types::StoreId;

/// A branch session over one [`MemoryConnection`].
#[derive(Debug)]
pub struct MemoryXaResource {
    conn: MemoryConnection,
}

impl MemoryXaResource {
    pub fn new(conn: MemoryConnection) -> Self {
        Self { conn }
    }

    fn active_branch(&self, xid: &GlobalTransactionId) -> StoreResult<&Branch> {
        match self.conn.txn.as_ref().and_then(|txn| txn.branch.as_ref()) {
            Some(branch) if branch.xid == *xid => Ok(branch),
            Some(branch) => Err(StoreError::XaProtocol(format!(
                "session is associated with {}, not {}",
                branch.xid, xid
            ))),
            None => Err(StoreError::UnknownBranch(xid.to_string())),
        }
    }
}

impl XaResource for MemoryXaResource {
    fn start(&mut self, xid: &GlobalTransactionId) -> StoreResult<()> {
        if self.conn.txn.is_some() {
            return Err(StoreError::XaProtocol(
                "session already has an open transaction".into(),
            ));
        }
        self.conn.set_auto_commit(false)?;
        let mut txn = self.conn.store.begin(self.conn.isolation);
        txn.branch = Some(Branch {
            xid: *xid,
            ended: false,
        });
        self.conn.txn = Some(txn);
        debug!(xid = %xid, store = %self.conn.store.store_id(), "branch started");
        Ok(())
    }

    fn end(&mut self, xid: &GlobalTransactionId) -> StoreResult<()> {
        self.active_branch(xid)?;
        if let Some(branch) = self.conn.txn.as_mut().and_then(|txn| txn.branch.as_mut()) {
            branch.ended = true;
        }
        Ok(())
    }

    fn prepare(&mut self, xid: &GlobalTransactionId) -> StoreResult<Vote> {
        if !self.active_branch(xid)?.ended {
            return Err(StoreError::XaProtocol(format!(
                "branch {} must be ended before prepare",
                xid
            )));
        }
        let txn = self
            .conn
            .txn
            .take()
            .ok_or_else(|| StoreError::UnknownBranch(xid.to_string()))?;
        Ok(self.conn.store.prepare(txn, *xid))
    }

    fn commit(&mut self, xid: &GlobalTransactionId) -> StoreResult<()> {
        if self.active_branch(xid).is_ok() {
            return Err(StoreError::XaProtocol(format!(
                "branch {} has not been prepared",
                xid
            )));
        }
        self.conn.store.commit_prepared(xid)
    }

    fn rollback(&mut self, xid: &GlobalTransactionId) -> StoreResult<()> {
        if self.active_branch(xid).is_ok() {
            if let Some(txn) = self.conn.txn.take() {
                self.conn.store.rollback(txn);
            }
            return Ok(());
        }
        self.conn.store.rollback_prepared(xid)
    }

    fn recover(&mut self) -> StoreResult<Vec<GlobalTransactionId>> {
        Ok(self.conn.store.prepared_branches())
    }

    fn connection(&mut self) -> &mut dyn Connection {
        &mut self.conn
    }
}

impl ResourceParticipant for MemoryStore {
    fn store_id(&self) -> &StoreId {
        &self.config().store_id
    }

    fn open(&self) -> StoreResult<Box<dyn XaResource>> {
        Ok(Box::new(MemoryXaResource::new(self.connect())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::store::{Row, RowKey, TableName};

    fn table() -> TableName {
        TableName::new("ledger").unwrap()
    }

    fn row(value: i64) -> Row {
        json!({ "value": value }).as_object().cloned().unwrap()
    }

    #[test]
    fn test_branch_lifecycle() {
        let store = MemoryStore::new();
        let xid = GlobalTransactionId::generate();
        let key = RowKey::new("entry-1").unwrap();

        let mut session = store.open().unwrap();
        session.start(&xid).unwrap();
        session.connection().insert(&table(), &key, row(10)).unwrap();
        session.end(&xid).unwrap();

        assert!(session.connection().get(&table(), &key).is_err());
        assert_eq!(session.prepare(&xid).unwrap(), Vote::Commit);
        assert_eq!(store.committed_row(&table(), &key), None);

        session.commit(&xid).unwrap();
        assert_eq!(store.committed_row(&table(), &key), Some(row(10)));
    }

    #[test]
    fn test_prepare_requires_end() {
        let store = MemoryStore::new();
        let xid = GlobalTransactionId::generate();

        let mut session = store.open().unwrap();
        session.start(&xid).unwrap();
        let err = session.prepare(&xid).unwrap_err();
        assert!(matches!(err, StoreError::XaProtocol(_)));
    }

    #[test]
    fn test_local_commit_refused_inside_branch() {
        let store = MemoryStore::new();
        let xid = GlobalTransactionId::generate();

        let mut session = store.open().unwrap();
        session.start(&xid).unwrap();
        session
            .connection()
            .upsert(&table(), &RowKey::new("x").unwrap(), row(1))
            .unwrap();
        assert!(session.connection().commit().is_err());
        session.rollback(&xid).unwrap();
        assert_eq!(store.prepared_count(), 0);
    }

    #[test]
    fn test_failed_statement_votes_rollback() {
        let store = MemoryStore::new();
        let key = RowKey::new("dup").unwrap();
        store.connect().insert(&table(), &key, row(1)).unwrap();

        let xid = GlobalTransactionId::generate();
        let mut session = store.open().unwrap();
        session.start(&xid).unwrap();
        assert!(session.connection().insert(&table(), &key, row(2)).is_err());
        session.end(&xid).unwrap();
        assert_eq!(session.prepare(&xid).unwrap(), Vote::Rollback);
    }

    #[test]
    fn test_recover_after_session_loss() {
        let store = MemoryStore::new();
        let xid = GlobalTransactionId::generate();
        let key = RowKey::new("orphan").unwrap();

        {
            let mut session = store.open().unwrap();
            session.start(&xid).unwrap();
            session.connection().upsert(&table(), &key, row(5)).unwrap();
            session.end(&xid).unwrap();
            assert_eq!(session.prepare(&xid).unwrap(), Vote::Commit);
        }

        let mut recovery = store.open().unwrap();
        assert_eq!(recovery.recover().unwrap(), vec![xid]);
        recovery.rollback(&xid).unwrap();
        assert!(recovery.recover().unwrap().is_empty());
        assert_eq!(store.committed_row(&table(), &key), None);
        assert_eq!(store.lock_owner(&table(), &key), None);
    }
}
