//! Resource participant interface for two-phase commit.
//!
//! One [`ResourceParticipant`] exists per independent store. For each
//! distributed transaction the coordinator opens an [`XaResource`] session on
//! it, runs the branch's work through [`XaResource::connection`], and then
//! drives the branch through end / prepare / commit-or-rollback.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::distributed::id::GlobalTransactionId;
use crate::store::{Connection, StoreId, StoreResult};

/// A participant's answer to the prepare request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    /// Changes are durable and will be committed on request.
    Commit,
    /// The branch cannot commit; it has been rolled back.
    Rollback,
    /// Nothing to commit; the branch is already finished.
    ReadOnly,
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vote::Commit => write!(f, "commit"),
            Vote::Rollback => write!(f, "rollback"),
            Vote::ReadOnly => write!(f, "read-only"),
        }
    }
}

/// A branch session on one participant store.
///
/// Every call is keyed by the branch's [`GlobalTransactionId`]. `commit`,
/// `rollback` and `recover` also work on a freshly opened session for
/// branches prepared by an earlier (possibly crashed) session.
pub trait XaResource: Send {
    /// Associate the session's next transaction with `xid`.
    fn start(&mut self, xid: &GlobalTransactionId) -> StoreResult<()>;

    /// Mark the branch's work complete. No statements may follow.
    fn end(&mut self, xid: &GlobalTransactionId) -> StoreResult<()>;

    /// Phase one: vote on the ended branch.
    fn prepare(&mut self, xid: &GlobalTransactionId) -> StoreResult<Vote>;

    /// Phase two: make a prepared branch durable.
    fn commit(&mut self, xid: &GlobalTransactionId) -> StoreResult<()>;

    /// Discard an active or prepared branch.
    fn rollback(&mut self, xid: &GlobalTransactionId) -> StoreResult<()>;

    /// Branches left prepared but undecided.
    fn recover(&mut self) -> StoreResult<Vec<GlobalTransactionId>>;

    /// The branch's transactional handle.
    fn connection(&mut self) -> &mut dyn Connection;
}

/// A store that can take part in a distributed transaction.
pub trait ResourceParticipant: Send + Sync {
    fn store_id(&self) -> &StoreId;

    /// Open a new branch session.
    fn open(&self) -> StoreResult<Box<dyn XaResource>>;
}
