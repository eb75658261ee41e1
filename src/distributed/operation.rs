//! Distributed operation description and protocol results.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::distributed::id::GlobalTransactionId;
use crate::distributed::participant::Vote;
use crate::store::{Connection, StoreId};
use crate::transaction::TransactionResult;

/// Work executed on one participant's branch connection.
pub type SubOperation =
    Box<dyn FnOnce(&mut dyn Connection) -> TransactionResult<Value> + Send + 'static>;

/// One atomic unit of work spanning several stores.
///
/// Steps run in the order they were added, each on the branch of its store.
/// Every step's store must also be listed as a participant.
#[derive(Default)]
pub struct DistributedOperation {
    participants: BTreeSet<StoreId>,
    steps: Vec<(StoreId, SubOperation)>,
}

impl DistributedOperation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant store. Participants without steps still take part
    /// in the protocol (and usually vote read-only).
    pub fn participant(mut self, store: StoreId) -> Self {
        self.participants.insert(store);
        self
    }

    /// Append a sub-operation for `store`.
    pub fn step<Op>(mut self, store: StoreId, operation: Op) -> Self
    where
        Op: FnOnce(&mut dyn Connection) -> TransactionResult<Value> + Send + 'static,
    {
        self.steps.push((store, Box::new(operation)));
        self
    }

    pub fn participant_ids(&self) -> &BTreeSet<StoreId> {
        &self.participants
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub(crate) fn into_parts(self) -> (BTreeSet<StoreId>, Vec<(StoreId, SubOperation)>) {
        (self.participants, self.steps)
    }
}

impl fmt::Debug for DistributedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedOperation")
            .field("participants", &self.participants)
            .field(
                "steps",
                &self.steps.iter().map(|(store, _)| store).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Final state of a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalOutcome {
    /// Every participant committed, or had nothing to commit.
    Committed,
    /// No participant committed.
    RolledBack,
    /// The commit decision was made and logged, but at least one participant
    /// failed to apply it. Those branches stay prepared until recovery.
    InDoubt,
}

impl fmt::Display for GlobalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GlobalOutcome::Committed => write!(f, "committed"),
            GlobalOutcome::RolledBack => write!(f, "rolled back"),
            GlobalOutcome::InDoubt => write!(f, "in doubt"),
        }
    }
}

/// Outcome of [`execute_distributed`](super::DistributedTransactionCoordinator::execute_distributed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedResult {
    pub transaction_id: GlobalTransactionId,
    /// True when the decision was commit, including the in-doubt case.
    pub successful: bool,
    pub outcome: GlobalOutcome,
    /// Sub-operation results per store, in step order.
    pub participant_results: BTreeMap<StoreId, Vec<Value>>,
    pub votes: BTreeMap<StoreId, Vote>,
    /// Participants that did not confirm the commit.
    pub in_doubt: Vec<StoreId>,
    pub error_message: Option<String>,
}

impl DistributedResult {
    pub(crate) fn new(transaction_id: GlobalTransactionId) -> Self {
        Self {
            transaction_id,
            successful: false,
            outcome: GlobalOutcome::RolledBack,
            participant_results: BTreeMap::new(),
            votes: BTreeMap::new(),
            in_doubt: Vec::new(),
            error_message: None,
        }
    }

    /// Whether some store may still disagree with the decision.
    pub fn needs_recovery(&self) -> bool {
        self.outcome == GlobalOutcome::InDoubt
    }
}

/// Outcome of a recovery scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub recovered_count: usize,
    pub recovered_ids: Vec<GlobalTransactionId>,
    /// Branches committed because a commit decision was logged.
    pub committed: Vec<GlobalTransactionId>,
    /// Branches rolled back for lack of a commit decision.
    pub rolled_back: Vec<GlobalTransactionId>,
    /// Stores that could not be scanned or whose branches could not be
    /// resolved, with every error seen for that store.
    pub failures: BTreeMap<StoreId, Vec<String>>,
}

impl RecoveryResult {
    pub(crate) fn record(&mut self, xid: GlobalTransactionId, committed: bool) {
        self.recovered_ids.push(xid);
        self.recovered_count = self.recovered_ids.len();
        if committed {
            self.committed.push(xid);
        } else {
            self.rolled_back.push(xid);
        }
    }

    pub(crate) fn fail(&mut self, store: &StoreId, error: impl ToString) {
        self.failures
            .entry(store.clone())
            .or_default()
            .push(error.to_string());
    }
}
