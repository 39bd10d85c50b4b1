//! Completion driver for top-level transactions.
//!
//! The driver decides nothing itself: it sequences `before_completion`, the
//! voting round (or the one-phase shortcut), the second phase and
//! `after_completion` on a coordinator it addresses by local tid.

use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::coordinator::Coordinator;
use crate::error::{TransactionError, TransactionResult};
use crate::freeze::FreezeGate;
use crate::status::Vote;
use crate::table::TransactionTable;
use crate::tid::LocalTid;

#[derive(Clone)]
pub struct CompletionDriver {
    local_tid: LocalTid,
    table: Arc<TransactionTable>,
    gate: Arc<FreezeGate>,
}

impl CompletionDriver {
    pub fn new(local_tid: LocalTid, table: Arc<TransactionTable>, gate: Arc<FreezeGate>) -> Self {
        Self {
            local_tid,
            table,
            gate,
        }
    }

    pub fn local_tid(&self) -> LocalTid {
        self.local_tid
    }

    fn coordinator(&self) -> TransactionResult<Arc<Coordinator>> {
        self.table
            .get(self.local_tid)
            .ok_or_else(|| TransactionError::UnknownTransaction(self.local_tid.to_string()))
    }

    fn claim(&self, coordinator: &Coordinator, operation: &'static str) -> TransactionResult<()> {
        if coordinator.begin_completing() {
            return Ok(());
        }
        if coordinator.is_aborted() {
            return Err(TransactionError::rolled_back("transaction timed out"));
        }
        Err(TransactionError::protocol(operation, coordinator.status()))
    }

    /// Commits the transaction.
    ///
    /// Failures of `before_completion` do not stop the decision procedure;
    /// they make it roll back. With `prompt_return` the call returns once
    /// the commit decision is durable and the second phase runs on a
    /// background thread, heuristic outcomes then only being logged.
    pub fn commit(&self, prompt_return: bool) -> TransactionResult<()> {
        let coordinator = self.coordinator()?;
        self.claim(&coordinator, "commit")?;
        let guard = self.gate.read();

        if let Err(e) = coordinator.before_completion() {
            debug!(
                global_tid = %coordinator.global_tid(),
                error = %e,
                "continuing after before_completion failure"
            );
        }

        let result = if coordinator.one_phase_eligible() {
            coordinator.commit_one_phase()
        } else {
            match coordinator.prepare() {
                Ok(Vote::Commit) if prompt_return => {
                    drop(guard);
                    return self.commit_in_background(coordinator);
                }
                Ok(Vote::Commit) => coordinator.commit(),
                Ok(Vote::ReadOnly) => Ok(()),
                Ok(Vote::Rollback) => {
                    let cause = coordinator
                        .rollback_cause()
                        .unwrap_or_else(|| "participant voted rollback".to_string());
                    coordinator
                        .rollback(true)
                        .and(Err(TransactionError::rolled_back(cause)))
                }
                Err(e) => Err(e),
            }
        };
        drop(guard);
        self.complete(&coordinator);
        result
    }

    fn commit_in_background(&self, coordinator: Arc<Coordinator>) -> TransactionResult<()> {
        let driver = self.clone();
        thread::Builder::new()
            .name(format!("tpc-commit-{}", self.local_tid))
            .spawn(move || {
                let guard = driver.gate.read();
                if let Err(e) = coordinator.commit() {
                    warn!(global_tid = %coordinator.global_tid(), error = %e, "background commit");
                }
                drop(guard);
                driver.complete(&coordinator);
            })
            .map_err(|source| TransactionError::ThreadSpawn {
                name: "commit",
                source,
            })?;
        Ok(())
    }

    /// Rolls the transaction back. No `before_completion` is delivered.
    pub fn rollback(&self) -> TransactionResult<()> {
        let coordinator = self.coordinator()?;
        self.claim(&coordinator, "rollback")?;
        let result = {
            let _guard = self.gate.read();
            coordinator.rollback(true)
        };
        self.complete(&coordinator);
        result
    }

    /// Unilateral rollback by the timeout authority.
    ///
    /// If another caller already owns completion the transaction is only
    /// marked rollback-only, and that caller's decision procedure rolls back.
    pub fn abort(&self) -> TransactionResult<bool> {
        let coordinator = self.coordinator()?;
        if !coordinator.begin_completing() {
            coordinator.set_rollback_only("transaction timed out");
            return Ok(false);
        }
        coordinator.mark_aborted();
        coordinator.set_rollback_only("transaction timed out");
        let result = {
            let _guard = self.gate.read();
            coordinator.rollback(false)
        };
        self.complete(&coordinator);
        result.map(|()| true)
    }

    /// Delivers `after_completion` and retires the coordinator. A coordinator
    /// whose outcome is unknown stays in the table for recovery.
    fn complete(&self, coordinator: &Coordinator) {
        let status = coordinator.status();
        if !status.is_terminal() {
            warn!(
                global_tid = %coordinator.global_tid(),
                %status,
                "outcome unknown, left for recovery"
            );
            return;
        }
        coordinator.after_completion();
        if let Err(e) = self.table.finish(self.local_tid) {
            warn!(
                global_tid = %coordinator.global_tid(),
                error = %e,
                "keypoint after completion failed"
            );
        }
    }
}
