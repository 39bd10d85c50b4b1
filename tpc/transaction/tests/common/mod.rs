#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tpc_log::LogConfig;
use tpc_transaction::{
    EventSemaphore, Outcome, Participant, ParticipantError, ParticipantResult, ResourceRegistry,
    Synchronization, TransactionService, TransactionServiceConfig, Vote,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Prepare,
    Commit,
    Rollback,
    CommitOnePhase,
    Forget,
}

/// Participant with scripted answers that records every call it receives.
pub struct MockParticipant {
    name: String,
    vote: ParticipantResult<Vote>,
    commit: ParticipantResult<()>,
    rollback: ParticipantResult<()>,
    calls: Mutex<Vec<Call>>,
}

impl MockParticipant {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            vote: Ok(Vote::Commit),
            commit: Ok(()),
            rollback: Ok(()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn voting(mut self, vote: Vote) -> Self {
        self.vote = Ok(vote);
        self
    }

    pub fn failing_prepare(mut self, message: &str) -> Self {
        self.vote = Err(ParticipantError::Failure(message.to_string()));
        self
    }

    pub fn failing_commit(mut self, error: ParticipantError) -> Self {
        self.commit = Err(error);
        self
    }

    pub fn failing_rollback(mut self, error: ParticipantError) -> Self {
        self.rollback = Err(error);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: Call) -> usize {
        self.calls.lock().iter().filter(|c| **c == call).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

impl Participant for MockParticipant {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn prepare(&self) -> ParticipantResult<Vote> {
        self.record(Call::Prepare);
        self.vote.clone()
    }

    fn commit(&self) -> ParticipantResult<()> {
        self.record(Call::Commit);
        self.commit.clone()
    }

    fn rollback(&self) -> ParticipantResult<()> {
        self.record(Call::Rollback);
        self.rollback.clone()
    }

    fn commit_one_phase(&self) -> ParticipantResult<()> {
        self.record(Call::CommitOnePhase);
        self.commit.clone()
    }

    fn forget(&self) -> ParticipantResult<()> {
        self.record(Call::Forget);
        Ok(())
    }
}

/// Synchronization that remembers the callbacks it saw.
#[derive(Default)]
pub struct RecordingSync {
    fail_before: bool,
    before: Mutex<usize>,
    after: Mutex<Vec<Outcome>>,
    completed: EventSemaphore,
}

impl RecordingSync {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_before: true,
            ..Self::default()
        })
    }

    pub fn before_count(&self) -> usize {
        *self.before.lock()
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.after.lock().clone()
    }

    pub fn completed(&self) -> &EventSemaphore {
        &self.completed
    }
}

impl Synchronization for RecordingSync {
    fn before_completion(&self) -> ParticipantResult<()> {
        *self.before.lock() += 1;
        if self.fail_before {
            return Err(ParticipantError::Failure("flush failed".to_string()));
        }
        Ok(())
    }

    fn after_completion(&self, outcome: Outcome) {
        self.after.lock().push(outcome);
        self.completed.post();
    }
}

pub fn service_config(dir: &Path) -> TransactionServiceConfig {
    TransactionServiceConfig {
        log: LogConfig {
            extent_size: 4096,
            extent_radix: 64,
            ..LogConfig::with_base_dir(dir)
        },
        ..TransactionServiceConfig::default()
    }
}

/// Starts a service and waits until its resync pass finished.
pub fn start_service(config: TransactionServiceConfig) -> TransactionService {
    start_with(config, &[])
}

pub fn start_with(
    config: TransactionServiceConfig,
    participants: &[Arc<MockParticipant>],
) -> TransactionService {
    let resources = Arc::new(ResourceRegistry::new());
    for participant in participants {
        resources.register(participant.clone());
    }
    let service = TransactionService::start_with_resources(config, resources).unwrap();
    service.wait_for_resync();
    service
}
