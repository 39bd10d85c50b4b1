//! Per-transaction coordinator.
//!
//! A coordinator is a monitor: every phase transition and registration
//! happens under its state mutex. Participant calls are made with the mutex
//! released so a slow participant never blocks status queries, the phase
//! recorded before the call (`Preparing`, `Committing`, `RollingBack`) keeps
//! other callers out. Records that must survive a crash are written to the
//! journal while the mutex is held, so a keypoint rewrite always observes a
//! state at least as recent as the last record.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tpc_log::{RecordType, WriteMode};
use tracing::{debug, warn};

use crate::error::{ParticipantError, TransactionError, TransactionResult};
use crate::journal::Journal;
use crate::participant::{Participant, RecoveryHandle, ResourceRegistry, Synchronization};
use crate::record::CoordinatorRecord;
use crate::status::{HeuristicKind, HeuristicOutcome, HeuristicReport, Outcome, Status, Vote};
use crate::tid::{GlobalTid, LocalTid};

type Target = (usize, String, Arc<dyn Participant>);

struct Enlisted {
    name: String,
    /// `None` for a recovered participant that was not resolved yet.
    resource: Option<Arc<dyn Participant>>,
    vote: Option<Vote>,
    completed: bool,
}

impl Enlisted {
    fn needs_completion(&self) -> bool {
        !self.completed && self.vote != Some(Vote::ReadOnly)
    }
}

struct CoordinatorState {
    status: Status,
    decision: Option<Outcome>,
    prepare_invoked: bool,
    rollback_only: bool,
    rollback_cause: Option<String>,
    /// A prepared or decided record is in the journal without its completion.
    durable: bool,
    participants: Vec<Enlisted>,
    synchronizations: Vec<Arc<dyn Synchronization>>,
    after_completion_done: bool,
    heuristic: Option<HeuristicReport>,
}

impl CoordinatorState {
    fn new(status: Status) -> Self {
        Self {
            status,
            decision: None,
            prepare_invoked: false,
            rollback_only: false,
            rollback_cause: None,
            durable: false,
            participants: Vec::new(),
            synchronizations: Vec::new(),
            after_completion_done: false,
            heuristic: None,
        }
    }

    fn targets(&self, include: impl Fn(&Enlisted) -> bool) -> Vec<Target> {
        self.participants
            .iter()
            .enumerate()
            .filter(|(_, enlisted)| include(enlisted))
            .filter_map(|(index, enlisted)| {
                enlisted
                    .resource
                    .as_ref()
                    .map(|resource| (index, enlisted.name.clone(), resource.clone()))
            })
            .collect()
    }

    fn pending_names(&self) -> Vec<String> {
        self.participants
            .iter()
            .filter(|enlisted| enlisted.needs_completion())
            .map(|enlisted| enlisted.name.clone())
            .collect()
    }

    fn all_completed(&self) -> bool {
        self.participants
            .iter()
            .all(|enlisted| !enlisted.needs_completion())
    }

    fn mark_rollback_only(&mut self, cause: String) {
        self.rollback_only = true;
        self.rollback_cause.get_or_insert(cause);
    }

    fn rollback_cause(&self) -> String {
        self.rollback_cause
            .clone()
            .unwrap_or_else(|| "transaction marked rollback-only".to_string())
    }
}

pub struct Coordinator {
    local_tid: LocalTid,
    global_tid: GlobalTid,
    subordinate: bool,
    deadline: Option<DateTime<Utc>>,
    journal: Option<Arc<Journal>>,
    /// Set by whoever takes ownership of driving completion.
    completing: AtomicBool,
    /// Set when the transaction was rolled back by the timeout authority.
    aborted: AtomicBool,
    state: Mutex<CoordinatorState>,
}

impl Coordinator {
    pub(crate) fn new(
        local_tid: LocalTid,
        global_tid: GlobalTid,
        subordinate: bool,
        deadline: Option<DateTime<Utc>>,
        journal: Option<Arc<Journal>>,
    ) -> Self {
        debug!(%global_tid, %local_tid, subordinate, "coordinator created");
        Self {
            local_tid,
            global_tid,
            subordinate,
            deadline,
            journal,
            completing: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            state: Mutex::new(CoordinatorState::new(Status::Active)),
        }
    }

    /// Rebuilds a coordinator from its journal records. A missing decision
    /// means a subordinate that voted commit and waits for its superior.
    pub(crate) fn recovered(
        local_tid: LocalTid,
        global_tid: GlobalTid,
        decision: Option<Outcome>,
        participants: Vec<String>,
        journal: Option<Arc<Journal>>,
    ) -> Self {
        let mut state = CoordinatorState::new(Status::Prepared);
        state.decision = decision;
        state.prepare_invoked = true;
        state.durable = true;
        state.participants = participants
            .into_iter()
            .map(|name| Enlisted {
                name,
                resource: None,
                vote: Some(Vote::Commit),
                completed: false,
            })
            .collect();
        if decision == Some(Outcome::RolledBack) {
            state.mark_rollback_only("rolled back before restart".to_string());
        }
        debug!(%global_tid, %local_tid, ?decision, "coordinator recovered");
        Self {
            local_tid,
            global_tid,
            subordinate: decision.is_none(),
            deadline: None,
            journal,
            completing: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            state: Mutex::new(state),
        }
    }

    pub fn local_tid(&self) -> LocalTid {
        self.local_tid
    }

    pub fn global_tid(&self) -> &GlobalTid {
        &self.global_tid
    }

    pub fn is_subordinate(&self) -> bool {
        self.subordinate
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn decision(&self) -> Option<Outcome> {
        self.state.lock().decision
    }

    pub fn is_rollback_only(&self) -> bool {
        self.state.lock().rollback_only
    }

    pub fn participant_names(&self) -> Vec<String> {
        let state = self.state.lock();
        state.participants.iter().map(|p| p.name.clone()).collect()
    }

    pub fn participant_count(&self) -> usize {
        self.state.lock().participants.len()
    }

    pub fn has_durable_state(&self) -> bool {
        self.state.lock().durable
    }

    pub fn rollback_cause(&self) -> Option<String> {
        self.state.lock().rollback_cause.clone()
    }

    pub fn heuristic_report(&self) -> Option<HeuristicReport> {
        self.state.lock().heuristic.clone()
    }

    /// True while the transaction is undecided and past its deadline.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
            && self.state.lock().status == Status::Active
    }

    /// The one-phase optimization applies to exactly one participant that was
    /// never asked to prepare.
    pub fn one_phase_eligible(&self) -> bool {
        let state = self.state.lock();
        state.status == Status::Active
            && !state.prepare_invoked
            && state.participants.len() == 1
    }

    pub(crate) fn begin_completing(&self) -> bool {
        self.completing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn mark_aborted(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn register_resource(
        &self,
        participant: Arc<dyn Participant>,
    ) -> TransactionResult<RecoveryHandle> {
        let mut state = self.state.lock();
        if state.status != Status::Active {
            return Err(TransactionError::protocol("register_resource", state.status));
        }
        let name = participant.name();
        debug!(global_tid = %self.global_tid, participant = %name, "resource registered");
        state.participants.push(Enlisted {
            name: name.clone(),
            resource: Some(participant),
            vote: None,
            completed: false,
        });
        Ok(RecoveryHandle {
            global_tid: self.global_tid.clone(),
            participant: name,
        })
    }

    pub fn register_synchronization(
        &self,
        synchronization: Arc<dyn Synchronization>,
    ) -> TransactionResult<()> {
        let mut state = self.state.lock();
        if state.status != Status::Active {
            return Err(TransactionError::protocol(
                "register_synchronization",
                state.status,
            ));
        }
        state.synchronizations.push(synchronization);
        Ok(())
    }

    pub fn set_rollback_only(&self, cause: impl Into<String>) {
        self.state.lock().mark_rollback_only(cause.into());
    }

    /// Runs `before_completion` on every synchronization. The first failure
    /// marks the transaction rollback-only and is returned.
    pub fn before_completion(&self) -> TransactionResult<()> {
        let synchronizations = {
            let state = self.state.lock();
            if state.status != Status::Active {
                return Err(TransactionError::protocol("before_completion", state.status));
            }
            state.synchronizations.clone()
        };
        for synchronization in synchronizations {
            if let Err(e) = synchronization.before_completion() {
                let cause = format!("before_completion failed: {e}");
                warn!(global_tid = %self.global_tid, error = %e, "before_completion failed");
                self.state.lock().mark_rollback_only(cause.clone());
                return Err(TransactionError::rolled_back(cause));
            }
        }
        Ok(())
    }

    fn write(
        &self,
        state: &mut CoordinatorState,
        record: CoordinatorRecord,
        mode: WriteMode,
    ) -> TransactionResult<()> {
        if let Some(journal) = &self.journal {
            journal.write(&record, RecordType::Normal, mode)?;
            state.durable = !matches!(record, CoordinatorRecord::Completed { .. });
        }
        Ok(())
    }

    /// Logs `outcome` and only then adopts it. When the write fails the
    /// decision stays unset, so nothing acts on an outcome that may not be
    /// durable.
    fn write_decision(
        &self,
        state: &mut CoordinatorState,
        outcome: Outcome,
    ) -> TransactionResult<()> {
        let record = CoordinatorRecord::Decided {
            global_tid: self.global_tid.clone(),
            outcome,
            participants: state.pending_names(),
        };
        if let Err(e) = self.write(state, record, WriteMode::Forced) {
            warn!(
                global_tid = %self.global_tid,
                %outcome,
                error = %e,
                "decision not logged, outcome unknown"
            );
            return Err(e);
        }
        state.decision = Some(outcome);
        debug!(global_tid = %self.global_tid, %outcome, "decision logged");
        Ok(())
    }

    /// Collects votes from every participant.
    ///
    /// The first rollback vote or failure stops the round: remaining
    /// participants are not asked. A rollback decision is logged before
    /// returning. When every participant voted read-only the transaction is
    /// committed without a second phase.
    pub fn prepare(&self) -> TransactionResult<Vote> {
        let (targets, mut rollback_cause) = {
            let mut state = self.state.lock();
            if state.status != Status::Active {
                return Err(TransactionError::protocol("prepare", state.status));
            }
            state.prepare_invoked = true;
            state.status = Status::Preparing;
            debug!(global_tid = %self.global_tid, "preparing");
            let cause = state.rollback_only.then(|| state.rollback_cause());
            (state.targets(|p| p.vote.is_none()), cause)
        };

        let mut votes = Vec::with_capacity(targets.len());
        if rollback_cause.is_none() {
            for (index, name, resource) in targets {
                match resource.prepare() {
                    Ok(Vote::Rollback) => {
                        rollback_cause = Some(format!("{name} voted rollback"));
                        break;
                    }
                    Ok(vote) => votes.push((index, vote)),
                    Err(e) => {
                        warn!(
                            global_tid = %self.global_tid,
                            participant = %name,
                            error = %e,
                            "prepare failed"
                        );
                        rollback_cause = Some(format!("{name} failed to prepare: {e}"));
                        break;
                    }
                }
            }
        }

        let mut state = self.state.lock();
        for (index, vote) in votes {
            state.participants[index].vote = Some(vote);
        }
        if rollback_cause.is_none() && state.rollback_only {
            rollback_cause = Some(state.rollback_cause());
        }

        if let Some(cause) = rollback_cause {
            state.mark_rollback_only(cause);
            self.write_decision(&mut state, Outcome::RolledBack)?;
            state.status = Status::Prepared;
            return Ok(Vote::Rollback);
        }

        let commit_voters = state
            .participants
            .iter()
            .filter(|p| p.vote == Some(Vote::Commit))
            .count();
        if commit_voters == 0 {
            state.decision = Some(Outcome::Committed);
            state.status = Status::Committed;
            debug!(global_tid = %self.global_tid, "all participants read-only");
            return Ok(Vote::ReadOnly);
        }

        if self.subordinate {
            let record = CoordinatorRecord::Prepared {
                global_tid: self.global_tid.clone(),
                participants: state.pending_names(),
            };
            self.write(&mut state, record, WriteMode::Forced)?;
        } else {
            self.write_decision(&mut state, Outcome::Committed)?;
        }
        state.status = Status::Prepared;
        debug!(global_tid = %self.global_tid, commit_voters, "prepared");
        Ok(Vote::Commit)
    }

    /// Second phase of a commit decision. A prepared subordinate without a
    /// decision takes commit as its superior's decision.
    pub fn commit(&self) -> TransactionResult<()> {
        let targets = {
            let mut state = self.state.lock();
            match (state.status, state.decision) {
                (Status::Prepared, Some(Outcome::Committed)) => {}
                (Status::Prepared, None) if self.subordinate => {
                    self.write_decision(&mut state, Outcome::Committed)?;
                }
                (status, _) => return Err(TransactionError::protocol("commit", status)),
            }
            state.status = Status::Committing;
            state.targets(Enlisted::needs_completion)
        };

        let mut report = HeuristicReport::new(Outcome::Committed);
        let mut done = Vec::with_capacity(targets.len());
        for (index, name, resource) in targets {
            match resource.commit() {
                Ok(()) => {}
                Err(ParticipantError::Heuristic(kind)) => {
                    report.record(&name, kind);
                    forget(&name, &resource);
                }
                Err(ParticipantError::RolledBack) => {
                    report.record(&name, HeuristicKind::Rollback);
                }
                Err(e) => {
                    warn!(
                        global_tid = %self.global_tid,
                        participant = %name,
                        error = %e,
                        "commit failed"
                    );
                    report.record(&name, HeuristicKind::Hazard);
                }
            }
            done.push(index);
        }
        self.finish(Outcome::Committed, done, report, true)
    }

    /// Commits the single participant without a voting round. A failure of
    /// the participant counts as a rollback vote.
    pub fn commit_one_phase(&self) -> TransactionResult<()> {
        let (index, name, resource) = {
            let mut state = self.state.lock();
            let eligible = state.status == Status::Active
                && !state.prepare_invoked
                && state.participants.len() == 1;
            if !eligible {
                return Err(TransactionError::protocol("commit_one_phase", state.status));
            }
            if state.rollback_only {
                let cause = state.rollback_cause();
                drop(state);
                self.rollback(true)?;
                return Err(TransactionError::rolled_back(cause));
            }
            let Some(target) = state.targets(|_| true).pop() else {
                return Err(TransactionError::protocol("commit_one_phase", state.status));
            };
            state.status = Status::Committing;
            target
        };

        let mut report = HeuristicReport::new(Outcome::Committed);
        let rollback_cause = match resource.commit_one_phase() {
            Ok(()) => None,
            Err(ParticipantError::Heuristic(HeuristicKind::Rollback)) => {
                forget(&name, &resource);
                Some(format!("{name} rolled back heuristically"))
            }
            Err(ParticipantError::Heuristic(kind)) => {
                report.record(&name, kind);
                forget(&name, &resource);
                None
            }
            Err(ParticipantError::RolledBack) => Some(format!("{name} rolled back")),
            Err(e) => {
                warn!(
                    global_tid = %self.global_tid,
                    participant = %name,
                    error = %e,
                    "one-phase commit failed"
                );
                if let Err(e) = resource.rollback() {
                    debug!(
                        participant = %name,
                        error = %e,
                        "rollback after failed one-phase commit"
                    );
                }
                Some(format!("{name} failed to commit: {e}"))
            }
        };

        match rollback_cause {
            None => self.finish(Outcome::Committed, vec![index], report, true),
            Some(cause) => {
                self.state.lock().mark_rollback_only(cause.clone());
                self.finish(
                    Outcome::RolledBack,
                    vec![index],
                    HeuristicReport::new(Outcome::RolledBack),
                    true,
                )?;
                Err(TransactionError::rolled_back(cause))
            }
        }
    }

    /// Rolls back every participant, continuing past individual failures.
    ///
    /// Legal while active, while preparing (the preparing thread turns it into
    /// a rollback decision) and once prepared with a rollback decision or as
    /// an undecided subordinate.
    pub fn rollback(&self, report_heuristics: bool) -> TransactionResult<()> {
        let targets = {
            let mut state = self.state.lock();
            match (state.status, state.decision) {
                (Status::Active, _) => {}
                (Status::Preparing, _) => {
                    state.mark_rollback_only("rolled back while preparing".to_string());
                    return Ok(());
                }
                (Status::Prepared, Some(Outcome::RolledBack)) => {}
                (Status::Prepared, None) if self.subordinate => {}
                (status, _) => return Err(TransactionError::protocol("rollback", status)),
            }
            state.status = Status::RollingBack;
            state.decision = Some(Outcome::RolledBack);
            state.targets(Enlisted::needs_completion)
        };
        debug!(global_tid = %self.global_tid, participants = targets.len(), "rolling back");

        let mut report = HeuristicReport::new(Outcome::RolledBack);
        let mut done = Vec::with_capacity(targets.len());
        for (index, name, resource) in targets {
            match resource.rollback() {
                Ok(()) | Err(ParticipantError::RolledBack) => {}
                Err(ParticipantError::Heuristic(kind)) => {
                    report.record(&name, kind);
                    forget(&name, &resource);
                }
                Err(e) => {
                    warn!(
                        global_tid = %self.global_tid,
                        participant = %name,
                        error = %e,
                        "rollback failed"
                    );
                    report.record(&name, HeuristicKind::Hazard);
                }
            }
            done.push(index);
        }
        self.finish(Outcome::RolledBack, done, report, report_heuristics)
    }

    fn finish(
        &self,
        outcome: Outcome,
        done: Vec<usize>,
        report: HeuristicReport,
        report_heuristics: bool,
    ) -> TransactionResult<()> {
        let heuristic = report.outcome();
        {
            let mut state = self.state.lock();
            for index in done {
                state.participants[index].completed = true;
            }
            state.decision = Some(outcome);
            state.status = match (heuristic, outcome) {
                (Some(kind), _) => Status::HeuristicallyCompleted(kind),
                (None, Outcome::Committed) => Status::Committed,
                (None, Outcome::RolledBack) => Status::RolledBack,
            };
            if state.durable && state.all_completed() {
                let record = CoordinatorRecord::Completed {
                    global_tid: self.global_tid.clone(),
                    heuristic,
                };
                self.write(&mut state, record, WriteMode::Buffered)?;
            }
            if heuristic.is_some() {
                state.heuristic = Some(report.clone());
            }
            debug!(global_tid = %self.global_tid, status = %state.status, "completed");
        }

        match heuristic {
            None => Ok(()),
            Some(kind) => {
                warn!(global_tid = %self.global_tid, %kind, %report, "heuristic outcome");
                if !report_heuristics {
                    return Ok(());
                }
                match kind {
                    HeuristicOutcome::Mixed => Err(TransactionError::HeuristicMixed(report)),
                    HeuristicOutcome::Hazard => Err(TransactionError::HeuristicHazard(report)),
                }
            }
        }
    }

    /// Tells every synchronization about the outcome. Runs at most once;
    /// returns the outcome reported, or `None` if it already ran.
    pub fn after_completion(&self) -> Option<Outcome> {
        let (synchronizations, outcome) = {
            let mut state = self.state.lock();
            if state.after_completion_done {
                return None;
            }
            state.after_completion_done = true;
            let outcome = state.decision.unwrap_or(Outcome::RolledBack);
            (std::mem::take(&mut state.synchronizations), outcome)
        };
        for synchronization in synchronizations {
            synchronization.after_completion(outcome);
        }
        debug!(global_tid = %self.global_tid, %outcome, "after_completion delivered");
        Some(outcome)
    }

    /// Answers a participant asking what happened to its branch.
    pub fn replay_completion(&self, participant: &str) -> Status {
        let state = self.state.lock();
        let status = state.status.replay_outcome(state.decision);
        debug!(global_tid = %self.global_tid, participant, %status, "replay_completion");
        status
    }

    /// Records that `participant` completed its branch on its own after
    /// asking for the outcome. Returns true once nothing is left to complete.
    pub(crate) fn acknowledge(&self, participant: &str) -> TransactionResult<bool> {
        let mut state = self.state.lock();
        let Some(outcome) = state.decision else {
            return Ok(false);
        };
        if let Some(enlisted) = state
            .participants
            .iter_mut()
            .find(|enlisted| enlisted.name == participant)
        {
            enlisted.completed = true;
        }
        if !state.all_completed() {
            return Ok(false);
        }
        if state.durable {
            let record = CoordinatorRecord::Completed {
                global_tid: self.global_tid.clone(),
                heuristic: None,
            };
            self.write(&mut state, record, WriteMode::Buffered)?;
        }
        if !state.status.is_terminal() {
            state.status = match outcome {
                Outcome::Committed => Status::Committed,
                Outcome::RolledBack => Status::RolledBack,
            };
        }
        Ok(true)
    }

    /// Binds recovered participants to live resources. Returns the names that
    /// could not be resolved.
    pub(crate) fn attach_resources(&self, registry: &ResourceRegistry) -> Vec<String> {
        let mut state = self.state.lock();
        let mut unresolved = Vec::new();
        for enlisted in state
            .participants
            .iter_mut()
            .filter(|enlisted| enlisted.resource.is_none() && enlisted.needs_completion())
        {
            match registry.resolve(&enlisted.name) {
                Some(resource) => enlisted.resource = Some(resource),
                None => unresolved.push(enlisted.name.clone()),
            }
        }
        unresolved
    }

    /// Writes the durable state of this coordinator as a rewrite record.
    /// Returns false when there is nothing durable to rewrite.
    pub(crate) fn rewrite(&self, journal: &Journal) -> TransactionResult<bool> {
        let state = self.state.lock();
        if !state.durable {
            return Ok(false);
        }
        let participants = state.pending_names();
        let record = match state.decision {
            Some(outcome) => CoordinatorRecord::Decided {
                global_tid: self.global_tid.clone(),
                outcome,
                participants,
            },
            None => CoordinatorRecord::Prepared {
                global_tid: self.global_tid.clone(),
                participants,
            },
        };
        journal.write(&record, RecordType::Rewrite, WriteMode::Buffered)?;
        Ok(true)
    }
}

fn forget(name: &str, resource: &Arc<dyn Participant>) {
    if let Err(e) = resource.forget() {
        warn!(participant = name, error = %e, "forget failed");
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("local_tid", &self.local_tid)
            .field("global_tid", &self.global_tid)
            .field("status", &self.status())
            .finish()
    }
}
