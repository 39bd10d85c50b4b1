//! XA terminator for inbound transactions.
//!
//! An external transaction manager owns the outcome of an imported
//! transaction and completes it through this surface. Xids map onto global
//! tids one to one. Only one thread may complete a given xid at a time, and
//! an xid cannot be completed while work is still associated with it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use crate::coordinator::Coordinator;
use crate::error::{TransactionError, TransactionResult, XaError, XaResult};
use crate::freeze::FreezeGate;
use crate::recovery::RecoveryManager;
use crate::status::{HeuristicOutcome, Status, Vote};
use crate::table::TransactionTable;
use crate::tid::{GlobalTid, LocalTid, Xid};

pub const TMNOFLAGS: i32 = 0;
pub const TMENDRSCAN: i32 = 0x0080_0000;
pub const TMSTARTRSCAN: i32 = 0x0100_0000;

/// Successful answer to an XA prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaVote {
    /// `XA_OK`: prepared, waiting for commit or rollback.
    Ok,
    /// `XA_RDONLY`: nothing to commit, the branch is already finished.
    ReadOnly,
}

pub struct XaTerminator {
    table: Arc<TransactionTable>,
    recovery: Arc<RecoveryManager>,
    gate: Arc<FreezeGate>,
    /// Xids currently being completed.
    in_flight: DashMap<GlobalTid, ()>,
    /// Number of work associations per imported xid.
    associations: DashMap<GlobalTid, usize>,
}

struct InFlight<'a> {
    terminator: &'a XaTerminator,
    global_tid: GlobalTid,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.terminator.in_flight.remove(&self.global_tid);
    }
}

impl XaTerminator {
    pub fn new(
        table: Arc<TransactionTable>,
        recovery: Arc<RecoveryManager>,
        gate: Arc<FreezeGate>,
    ) -> Self {
        Self {
            table,
            recovery,
            gate,
            in_flight: DashMap::new(),
            associations: DashMap::new(),
        }
    }

    /// Associates work with `xid`, creating a subordinate coordinator the
    /// first time the xid is seen.
    pub fn import(&self, xid: &Xid, deadline: Option<DateTime<Utc>>) -> XaResult<LocalTid> {
        xid.validate()?;
        let global_tid = GlobalTid::from(xid);
        let local_tid = match self.recovery.lookup(&global_tid) {
            Some(coordinator) => coordinator.local_tid(),
            None => self
                .table
                .create(global_tid.clone(), true, deadline)
                .map_err(XaError::from)?
                .local_tid(),
        };
        *self.associations.entry(global_tid.clone()).or_insert(0) += 1;
        debug!(%global_tid, %local_tid, "xid imported");
        Ok(local_tid)
    }

    /// Ends one work association with `xid`.
    pub fn release(&self, xid: &Xid) -> XaResult<()> {
        xid.validate()?;
        let global_tid = GlobalTid::from(xid);
        match self.associations.entry(global_tid) {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() -= 1;
                if *entry.get() == 0 {
                    entry.remove();
                }
                Ok(())
            }
            Entry::Vacant(entry) => Err(XaError::Protocol(format!(
                "no work associated with {}",
                entry.key()
            ))),
        }
    }

    fn enter(&self, xid: &Xid) -> XaResult<(Arc<Coordinator>, InFlight<'_>)> {
        xid.validate()?;
        let global_tid = GlobalTid::from(xid);
        let coordinator = self
            .recovery
            .lookup(&global_tid)
            .ok_or_else(|| XaError::NoTransaction(global_tid.to_string()))?;
        let unresolved = coordinator.attach_resources(self.recovery.resources());
        if !unresolved.is_empty() {
            debug!(%global_tid, ?unresolved, "completing without some recovered participants");
        }
        if self.associations.contains_key(&global_tid) {
            return Err(XaError::Protocol(format!(
                "work is still associated with {global_tid}"
            )));
        }
        match self.in_flight.entry(global_tid.clone()) {
            Entry::Occupied(_) => Err(XaError::Protocol(format!(
                "{global_tid} is being completed by another thread"
            ))),
            Entry::Vacant(entry) => {
                entry.insert(());
                Ok((
                    coordinator,
                    InFlight {
                        terminator: self,
                        global_tid,
                    },
                ))
            }
        }
    }

    fn retire(&self, coordinator: &Coordinator) -> TransactionResult<()> {
        if !coordinator.status().is_terminal() {
            return Ok(());
        }
        // Heuristic outcomes stay until forget.
        if matches!(coordinator.status(), Status::HeuristicallyCompleted(_)) {
            return Ok(());
        }
        coordinator.after_completion();
        self.recovery.forget_recovered(coordinator.local_tid());
        self.table.finish(coordinator.local_tid())
    }

    fn finish(&self, coordinator: &Coordinator, result: TransactionResult<()>) -> XaResult<()> {
        if let Err(e) = self.retire(coordinator) {
            warn!(global_tid = %coordinator.global_tid(), error = %e, "retiring xa branch");
        }
        result.map_err(XaError::from)
    }

    pub fn prepare(&self, xid: &Xid) -> XaResult<XaVote> {
        let (coordinator, _in_flight) = self.enter(xid)?;
        if !coordinator.begin_completing() && !coordinator.is_subordinate() {
            return Err(XaError::Protocol(format!(
                "{} is completed by its own driver",
                coordinator.global_tid()
            )));
        }
        let _guard = self.gate.read();
        if let Err(e) = coordinator.before_completion() {
            debug!(
                global_tid = %coordinator.global_tid(),
                error = %e,
                "before_completion failed during xa prepare"
            );
        }
        match coordinator.prepare().map_err(XaError::from)? {
            Vote::Commit => Ok(XaVote::Ok),
            Vote::ReadOnly => {
                self.finish(&coordinator, Ok(()))?;
                Ok(XaVote::ReadOnly)
            }
            Vote::Rollback => {
                let cause = coordinator
                    .rollback_cause()
                    .unwrap_or_else(|| "participant voted rollback".to_string());
                let result = coordinator.rollback(false);
                self.finish(&coordinator, result)?;
                Err(XaError::RolledBack(cause))
            }
        }
    }

    /// Commits `xid`. With `one_phase` the branch must not be prepared yet
    /// and the whole decision procedure runs here.
    pub fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()> {
        let (coordinator, _in_flight) = self.enter(xid)?;
        coordinator.begin_completing();
        let _guard = self.gate.read();

        if !one_phase {
            if coordinator.status() != Status::Prepared {
                return Err(XaError::Protocol(format!(
                    "{} is {} and cannot be committed in two phases",
                    coordinator.global_tid(),
                    coordinator.status()
                )));
            }
            let result = coordinator.commit();
            return self.finish(&coordinator, result);
        }

        if coordinator.status() != Status::Active {
            return Err(XaError::Protocol(format!(
                "{} is {} and cannot be committed in one phase",
                coordinator.global_tid(),
                coordinator.status()
            )));
        }
        if let Err(e) = coordinator.before_completion() {
            debug!(
                global_tid = %coordinator.global_tid(),
                error = %e,
                "before_completion failed during xa commit"
            );
        }
        let result = if coordinator.one_phase_eligible() {
            coordinator.commit_one_phase()
        } else {
            match coordinator.prepare() {
                Ok(Vote::Commit) => coordinator.commit(),
                Ok(Vote::ReadOnly) => Ok(()),
                Ok(Vote::Rollback) => {
                    let cause = coordinator
                        .rollback_cause()
                        .unwrap_or_else(|| "participant voted rollback".to_string());
                    coordinator
                        .rollback(false)
                        .and(Err(TransactionError::RolledBack { cause }))
                }
                Err(e) => Err(e),
            }
        };
        self.finish(&coordinator, result)
    }

    pub fn rollback(&self, xid: &Xid) -> XaResult<()> {
        let (coordinator, _in_flight) = self.enter(xid)?;
        coordinator.begin_completing();
        let result = {
            let _guard = self.gate.read();
            coordinator.rollback(true)
        };
        self.finish(&coordinator, result)
    }

    /// Lists prepared branches waiting for an outcome. The list is returned
    /// on `TMSTARTRSCAN`; later calls of the same scan return nothing.
    pub fn recover(&self, flags: i32) -> XaResult<Vec<Xid>> {
        if flags & !(TMSTARTRSCAN | TMENDRSCAN) != TMNOFLAGS {
            return Err(XaError::InvalidArguments(format!(
                "unsupported recover flags {flags:#x}"
            )));
        }
        self.recovery.wait_for_resync();
        if flags & TMSTARTRSCAN == 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .table
            .coordinators()
            .into_iter()
            .filter(|coordinator| {
                coordinator.is_subordinate()
                    && coordinator.status() == Status::Prepared
                    && coordinator.decision().is_none()
            })
            .map(|coordinator| coordinator.global_tid().to_xid())
            .collect())
    }

    /// Discards a heuristically completed branch.
    pub fn forget(&self, xid: &Xid) -> XaResult<()> {
        let (coordinator, _in_flight) = self.enter(xid)?;
        match coordinator.status() {
            Status::HeuristicallyCompleted(kind) => {
                debug!(
                    global_tid = %coordinator.global_tid(),
                    %kind,
                    "forgetting heuristic outcome"
                );
                coordinator.after_completion();
                self.recovery.forget_recovered(coordinator.local_tid());
                self.table
                    .finish(coordinator.local_tid())
                    .map_err(XaError::from)
            }
            status => Err(XaError::Protocol(format!(
                "{} is {status}, nothing to forget",
                coordinator.global_tid()
            ))),
        }
    }

    pub fn heuristic(&self, xid: &Xid) -> Option<HeuristicOutcome> {
        match self.table.find(&GlobalTid::from(xid))?.status() {
            Status::HeuristicallyCompleted(kind) => Some(kind),
            _ => None,
        }
    }
}
