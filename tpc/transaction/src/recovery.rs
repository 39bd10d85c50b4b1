//! Restart recovery.
//!
//! `recover` rebuilds a coordinator for every transaction the journal shows
//! as prepared or decided but not completed. Until it finishes, lookups of an
//! unknown global tid block instead of failing. `resync` then drives every
//! recovered coordinator whose decision is known and whose participants can
//! be resolved to completion.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::error::TransactionResult;
use crate::event::EventSemaphore;
use crate::freeze::FreezeGate;
use crate::journal::Journal;
use crate::participant::{RecoveryHandle, ResourceRegistry};
use crate::record::CoordinatorRecord;
use crate::status::{Outcome, Status};
use crate::table::TransactionTable;
use crate::tid::{GlobalTid, LocalTid};

/// State of one transaction as reconstructed from the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredTransaction {
    pub global_tid: GlobalTid,
    /// `None` for a subordinate still waiting for its superior.
    pub decision: Option<Outcome>,
    pub participants: Vec<String>,
}

/// Folds the journal into the set of unfinished transactions, in the order
/// they first appear. Reads only; replaying twice gives the same result.
pub fn scan(journal: &Journal) -> TransactionResult<Vec<RecoveredTransaction>> {
    let mut slots: Vec<Option<RecoveredTransaction>> = Vec::new();
    let mut index: HashMap<GlobalTid, usize> = HashMap::new();

    for record in journal.replay()? {
        let (global_tid, state) = match record {
            CoordinatorRecord::Prepared {
                global_tid,
                participants,
            } => (global_tid, Some((None, participants))),
            CoordinatorRecord::Decided {
                global_tid,
                outcome,
                participants,
            } => (global_tid, Some((Some(outcome), participants))),
            CoordinatorRecord::Completed { global_tid, .. } => (global_tid, None),
        };
        match (state, index.get(&global_tid).copied()) {
            (Some((decision, participants)), Some(slot)) => {
                slots[slot] = Some(RecoveredTransaction {
                    global_tid,
                    decision,
                    participants,
                });
            }
            (Some((decision, participants)), None) => {
                index.insert(global_tid.clone(), slots.len());
                slots.push(Some(RecoveredTransaction {
                    global_tid,
                    decision,
                    participants,
                }));
            }
            (None, Some(slot)) => {
                index.remove(&global_tid);
                slots[slot] = None;
            }
            (None, None) => {}
        }
    }
    Ok(slots.into_iter().flatten().collect())
}

pub struct RecoveryManager {
    table: Arc<TransactionTable>,
    resources: Arc<ResourceRegistry>,
    gate: Arc<FreezeGate>,
    recovered: DashMap<LocalTid, GlobalTid>,
    recovery_done: EventSemaphore,
    resync_done: EventSemaphore,
}

impl RecoveryManager {
    pub fn new(
        table: Arc<TransactionTable>,
        resources: Arc<ResourceRegistry>,
        gate: Arc<FreezeGate>,
    ) -> Self {
        Self {
            table,
            resources,
            gate,
            recovered: DashMap::new(),
            recovery_done: EventSemaphore::new(),
            resync_done: EventSemaphore::new(),
        }
    }

    pub fn resources(&self) -> &Arc<ResourceRegistry> {
        &self.resources
    }

    /// Scans the journal and registers a coordinator for every unfinished
    /// transaction. A corrupt journal fails recovery as a whole.
    pub fn recover(&self) -> TransactionResult<usize> {
        let result = self.recover_inner();
        self.recovery_done.post();
        result
    }

    fn recover_inner(&self) -> TransactionResult<usize> {
        let Some(journal) = self.table.journal() else {
            return Ok(0);
        };
        let mut count = 0;
        for transaction in scan(journal)? {
            if self.table.contains(&transaction.global_tid) {
                continue;
            }
            let coordinator = self.table.insert_recovered(
                transaction.global_tid.clone(),
                transaction.decision,
                transaction.participants,
            )?;
            self.recovered
                .insert(coordinator.local_tid(), transaction.global_tid);
            count += 1;
        }
        info!(count, "recovery scan complete");
        Ok(count)
    }

    pub fn is_recovery_done(&self) -> bool {
        self.recovery_done.is_posted()
    }

    pub fn wait_for_recovery(&self) {
        self.recovery_done.wait();
    }

    pub fn is_resync_done(&self) -> bool {
        self.resync_done.is_posted()
    }

    pub fn wait_for_resync(&self) {
        self.resync_done.wait();
    }

    /// Completes every recovered coordinator that can be completed, then
    /// compacts the journal. Returns how many were completed.
    pub fn resync(&self) -> TransactionResult<usize> {
        self.wait_for_recovery();
        let result = self.resync_inner();
        self.resync_done.post();
        result
    }

    fn resync_inner(&self) -> TransactionResult<usize> {
        let mut local_tids: Vec<LocalTid> =
            self.recovered.iter().map(|entry| *entry.key()).collect();
        local_tids.sort();

        let mut completed = 0;
        for local_tid in local_tids {
            let Some(coordinator) = self.table.get(local_tid) else {
                self.recovered.remove(&local_tid);
                continue;
            };
            let Some(decision) = coordinator.decision() else {
                debug!(global_tid = %coordinator.global_tid(), "in doubt, waiting for superior");
                continue;
            };
            let unresolved = coordinator.attach_resources(&self.resources);
            if !unresolved.is_empty() {
                warn!(
                    global_tid = %coordinator.global_tid(),
                    ?unresolved,
                    "participants not available for resync"
                );
                continue;
            }
            if !coordinator.begin_completing() {
                continue;
            }

            let result = {
                let _guard = self.gate.read();
                match decision {
                    Outcome::Committed => coordinator.commit(),
                    Outcome::RolledBack => coordinator.rollback(false),
                }
            };
            if let Err(e) = result {
                warn!(global_tid = %coordinator.global_tid(), error = %e, "resync completion");
            }
            if self.retire(&coordinator) {
                completed += 1;
            }
        }

        self.table.keypoint()?;
        info!(completed, remaining = self.recovered.len(), "resync complete");
        Ok(completed)
    }

    fn retire(&self, coordinator: &Coordinator) -> bool {
        if !coordinator.status().is_terminal() {
            return false;
        }
        coordinator.after_completion();
        self.recovered.remove(&coordinator.local_tid());
        if let Err(e) = self.table.finish(coordinator.local_tid()) {
            warn!(
                global_tid = %coordinator.global_tid(),
                error = %e,
                "keypoint after resync failed"
            );
        }
        true
    }

    /// Finds the coordinator of `global_tid`, blocking while recovery may
    /// still register it.
    pub fn lookup(&self, global_tid: &GlobalTid) -> Option<Arc<Coordinator>> {
        if let Some(coordinator) = self.table.find(global_tid) {
            return Some(coordinator);
        }
        if !self.recovery_done.is_posted() {
            debug!(%global_tid, "waiting for recovery before lookup");
            self.recovery_done.wait();
        }
        self.table.find(global_tid)
    }

    /// Outcome of the branch behind `handle`.
    ///
    /// An unknown transaction after recovery was never decided and is
    /// reported rolled back. A recovered participant that learns the final
    /// outcome is considered completed.
    pub fn replay_completion(&self, handle: &RecoveryHandle) -> TransactionResult<Status> {
        let Some(coordinator) = self.lookup(&handle.global_tid) else {
            debug!(global_tid = %handle.global_tid, "unknown transaction, presumed rolled back");
            return Ok(Status::RolledBack);
        };
        let status = coordinator.replay_completion(&handle.participant);
        let is_final = matches!(status, Status::Committed | Status::RolledBack);
        if is_final
            && self.recovered.contains_key(&coordinator.local_tid())
            && coordinator.acknowledge(&handle.participant)?
            && coordinator.begin_completing()
        {
            self.retire(&coordinator);
        }
        Ok(status)
    }

    /// Global tids of recovered transactions that are still unfinished.
    pub fn in_doubt(&self) -> Vec<GlobalTid> {
        let mut in_doubt: Vec<(LocalTid, GlobalTid)> = self
            .recovered
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        in_doubt.sort();
        in_doubt.into_iter().map(|(_, global_tid)| global_tid).collect()
    }

    pub fn is_recovered(&self, local_tid: LocalTid) -> bool {
        self.recovered.contains_key(&local_tid)
    }

    pub(crate) fn forget_recovered(&self, local_tid: LocalTid) {
        self.recovered.remove(&local_tid);
    }
}
