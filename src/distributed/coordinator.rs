//! Two-phase commit across independent stores.
//!
//! Protocol for one [`DistributedOperation`]:
//!
//! ```text
//!  open + start ──► run steps ──► end ──► prepare (vote) ──┬─► log commit ──► commit
//!                                                          └─► rollback all
//! ```
//!
//! Protocol failures (a step fails, a branch votes rollback, prepare errors)
//! roll every branch back and are reported through
//! [`DistributedResult`]. Only coordinator-level failures, such as an
//! unregistered store, an unreachable participant or a broken outcome log,
//! are returned as errors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::distributed::id::GlobalTransactionId;
use crate::distributed::operation::{
    DistributedOperation, DistributedResult, GlobalOutcome, RecoveryResult,
};
use crate::distributed::outcome_log::{InMemoryOutcomeLog, OutcomeLog};
use crate::distributed::participant::{ResourceParticipant, Vote, XaResource};
use crate::store::StoreId;
use crate::transaction::{TransactionError, TransactionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchState {
    Active,
    Ended,
    Prepared,
    /// Nothing left to do on the participant (read-only, voted rollback,
    /// rolled back or committed).
    Finished,
}

struct Branch {
    store: StoreId,
    xid: GlobalTransactionId,
    session: Box<dyn XaResource>,
    state: BranchState,
}

impl Branch {
    fn rollback(&mut self) {
        if matches!(
            self.state,
            BranchState::Active | BranchState::Ended | BranchState::Prepared
        ) {
            if let Err(err) = self.session.rollback(&self.xid) {
                warn!(store = %self.store, xid = %self.xid, error = %err, "branch rollback failed");
            }
        }
        self.state = BranchState::Finished;
    }
}

/// Coordinates distributed transactions over registered participants.
pub struct DistributedTransactionCoordinator {
    participants: BTreeMap<StoreId, Arc<dyn ResourceParticipant>>,
    log: Arc<dyn OutcomeLog>,
}

impl Default for DistributedTransactionCoordinator {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryOutcomeLog::new()))
    }
}

impl DistributedTransactionCoordinator {
    pub fn new(log: Arc<dyn OutcomeLog>) -> Self {
        Self {
            participants: BTreeMap::new(),
            log,
        }
    }

    /// Register a participant under its store id, replacing any previous
    /// registration for that id.
    pub fn register(&mut self, participant: Arc<dyn ResourceParticipant>) -> &mut Self {
        let store = participant.store_id().clone();
        debug!(store = %store, "participant registered");
        self.participants.insert(store, participant);
        self
    }

    pub fn participant_ids(&self) -> impl Iterator<Item = &StoreId> {
        self.participants.keys()
    }

    pub fn outcome_log(&self) -> &dyn OutcomeLog {
        self.log.as_ref()
    }

    /// Run `operation` atomically across its participants.
    pub fn execute_distributed(
        &self,
        operation: DistributedOperation,
    ) -> TransactionResult<DistributedResult> {
        let (participant_ids, steps) = operation.into_parts();
        self.validate(&participant_ids, steps.iter().map(|(store, _)| store))?;

        let root = GlobalTransactionId::generate();
        let mut result = DistributedResult::new(root);
        info!(
            global_id = %root.global_id,
            participants = participant_ids.len(),
            "distributed transaction started"
        );

        let mut branches = self.open_branches(&root, &participant_ids)?;

        for index in 0..branches.len() {
            let branch = &mut branches[index];
            if let Err(err) = branch.session.start(&branch.xid) {
                let message = format!("starting branch on {} failed: {err}", branch.store);
                return Ok(abort(&mut branches, result, &message));
            }
            branch.state = BranchState::Active;
        }

        // Run the steps on their branches.
        for (store, step) in steps {
            let Some(branch) = branches.iter_mut().find(|b| b.store == store) else {
                return Err(TransactionError::UnknownParticipant(store));
            };
            match step(branch.session.connection()) {
                Ok(value) => result
                    .participant_results
                    .entry(store)
                    .or_default()
                    .push(value),
                Err(err) => {
                    let message = format!("operation on {store} failed: {err}");
                    return Ok(abort(&mut branches, result, &message));
                }
            }
        }

        // End every branch.
        for index in 0..branches.len() {
            let branch = &mut branches[index];
            if let Err(err) = branch.session.end(&branch.xid) {
                let message = format!("ending branch on {} failed: {err}", branch.store);
                return Ok(abort(&mut branches, result, &message));
            }
            branch.state = BranchState::Ended;
        }

        // Phase one.
        for index in 0..branches.len() {
            let branch = &mut branches[index];
            match branch.session.prepare(&branch.xid) {
                Ok(vote) => {
                    debug!(store = %branch.store, %vote, "prepare vote");
                    result.votes.insert(branch.store.clone(), vote);
                    match vote {
                        Vote::Commit => branch.state = BranchState::Prepared,
                        Vote::ReadOnly => branch.state = BranchState::Finished,
                        Vote::Rollback => {
                            branch.state = BranchState::Finished;
                            let message = format!("{} voted to roll back", branch.store);
                            return Ok(abort(&mut branches, result, &message));
                        }
                    }
                }
                Err(err) => {
                    // A failed prepare leaves the branch state unknown; try
                    // to roll it back along with the others.
                    let message = format!("prepare on {} failed: {err}", branch.store);
                    return Ok(abort(&mut branches, result, &message));
                }
            }
        }

        let prepared: Vec<StoreId> = branches
            .iter()
            .filter(|b| b.state == BranchState::Prepared)
            .map(|b| b.store.clone())
            .collect();

        if prepared.is_empty() {
            info!(global_id = %root.global_id, "all participants read-only, nothing to commit");
            result.successful = true;
            result.outcome = GlobalOutcome::Committed;
            return Ok(result);
        }

        // The decision must be durable before any participant commits.
        if let Err(err) = self.log.record_commit(root.global_id, &prepared) {
            warn!(global_id = %root.global_id, error = %err, "failed to log commit decision, rolling back");
            for branch in branches.iter_mut() {
                branch.rollback();
            }
            return Err(err.into());
        }

        // Phase two.
        for branch in branches.iter_mut().filter(|b| b.state == BranchState::Prepared) {
            match branch.session.commit(&branch.xid) {
                Ok(()) => branch.state = BranchState::Finished,
                Err(err) => {
                    warn!(
                        store = %branch.store,
                        xid = %branch.xid,
                        error = %err,
                        "commit failed after commit decision, branch is in doubt"
                    );
                    result.in_doubt.push(branch.store.clone());
                }
            }
        }

        result.successful = true;
        if result.in_doubt.is_empty() {
            result.outcome = GlobalOutcome::Committed;
            if let Err(err) = self.log.complete(&root.global_id) {
                warn!(global_id = %root.global_id, error = %err, "failed to complete outcome log entry");
            }
            info!(global_id = %root.global_id, "distributed transaction committed");
        } else {
            result.outcome = GlobalOutcome::InDoubt;
            result.error_message = Some(format!(
                "commit not confirmed by: {}",
                join_stores(&result.in_doubt)
            ));
        }
        Ok(result)
    }

    /// Resolve branches left prepared on any registered participant.
    ///
    /// A branch is committed when the outcome log holds a commit decision
    /// for its global id and rolled back otherwise. A decision stays in the
    /// log until every store it names is registered and resolved. Run this when no
    /// distributed transaction is in flight, typically at startup: a branch
    /// that is prepared but not yet decided looks the same as an orphan.
    pub fn recover_pending_transactions(&self) -> TransactionResult<RecoveryResult> {
        let mut result = RecoveryResult::default();
        let mut unresolved = BTreeSet::new();

        for (store, participant) in &self.participants {
            let mut session = match participant.open() {
                Ok(session) => session,
                Err(err) => {
                    warn!(store = %store, error = %err, "recovery could not open participant");
                    result.fail(store, err);
                    continue;
                }
            };
            let pending = match session.recover() {
                Ok(pending) => pending,
                Err(err) => {
                    warn!(store = %store, error = %err, "recovery scan failed");
                    result.fail(store, err);
                    continue;
                }
            };

            for xid in pending {
                let commit = self.log.decision(&xid.global_id)?.is_some();
                let applied = if commit {
                    session.commit(&xid)
                } else {
                    session.rollback(&xid)
                };
                match applied {
                    Ok(()) => {
                        info!(store = %store, xid = %xid, commit, "recovered branch");
                        result.record(xid, commit);
                    }
                    Err(err) => {
                        warn!(store = %store, xid = %xid, error = %err, "failed to resolve branch");
                        result.fail(store, err);
                        unresolved.insert(xid.global_id);
                    }
                }
            }
        }

        // A decision is only done once every store it names has been
        // scanned; an unregistered store may still hold a prepared branch.
        for decision in self.log.outstanding()? {
            let blocked = unresolved.contains(&decision.global_id)
                || decision.participants.iter().any(|store| {
                    !self.participants.contains_key(store) || result.failures.contains_key(store)
                });
            if blocked {
                debug!(
                    global_id = %decision.global_id,
                    "commit decision kept for a later recovery"
                );
            } else {
                self.log.complete(&decision.global_id)?;
            }
        }

        info!(
            recovered = result.recovered_count,
            failures = result.failures.len(),
            "recovery finished"
        );
        Ok(result)
    }

    fn validate<'a>(
        &self,
        participant_ids: &BTreeSet<StoreId>,
        step_stores: impl Iterator<Item = &'a StoreId>,
    ) -> TransactionResult<()> {
        if participant_ids.is_empty() {
            return Err(TransactionError::Internal(
                "distributed operation has no participants".into(),
            ));
        }
        if let Some(store) = participant_ids
            .iter()
            .find(|store| !self.participants.contains_key(*store))
        {
            return Err(TransactionError::UnknownParticipant(store.clone()));
        }
        for store in step_stores {
            if !participant_ids.contains(store) {
                return Err(TransactionError::UnknownParticipant(store.clone()));
            }
        }
        Ok(())
    }

    fn open_branches(
        &self,
        root: &GlobalTransactionId,
        participant_ids: &BTreeSet<StoreId>,
    ) -> TransactionResult<Vec<Branch>> {
        let mut branches: Vec<Branch> = Vec::with_capacity(participant_ids.len());
        for store in participant_ids {
            let participant = self
                .participants
                .get(store)
                .ok_or_else(|| TransactionError::UnknownParticipant(store.clone()))?;
            let session = participant.open().map_err(|source| {
                TransactionError::ParticipantUnavailable {
                    store: store.clone(),
                    source,
                }
            })?;
            branches.push(Branch {
                store: store.clone(),
                xid: root.new_branch(),
                session,
                state: BranchState::Finished,
            });
        }
        Ok(branches)
    }
}

impl std::fmt::Debug for DistributedTransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedTransactionCoordinator")
            .field("participants", &self.participants.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Roll back every unfinished branch and produce the failed result.
fn abort(
    branches: &mut [Branch],
    mut result: DistributedResult,
    message: &str,
) -> DistributedResult {
    warn!(
        global_id = %result.transaction_id.global_id,
        reason = message,
        "distributed transaction rolled back"
    );
    for branch in branches.iter_mut() {
        branch.rollback();
    }
    result.successful = false;
    result.outcome = GlobalOutcome::RolledBack;
    result.error_message = Some(message.to_string());
    result
}

fn join_stores(stores: &[StoreId]) -> String {
    stores
        .iter()
        .map(StoreId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
