//! Capabilities a coordinator drives: participants (resources) that vote and
//! complete, and synchronizations that are told about completion.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::ParticipantResult;
use crate::status::{Outcome, Vote};
use crate::tid::GlobalTid;

/// A resource manager enlisted in a transaction. The coordinator is its only
/// caller.
pub trait Participant: Send + Sync {
    /// Stable name of the resource. Recovery uses it to find the resource
    /// again after a restart.
    fn name(&self) -> String;

    fn prepare(&self) -> ParticipantResult<Vote>;

    fn commit(&self) -> ParticipantResult<()>;

    fn rollback(&self) -> ParticipantResult<()>;

    fn commit_one_phase(&self) -> ParticipantResult<()>;

    /// Discards the heuristic outcome the participant remembered.
    fn forget(&self) -> ParticipantResult<()>;
}

/// Listener told before and after a transaction completes.
pub trait Synchronization: Send + Sync {
    fn before_completion(&self) -> ParticipantResult<()>;

    fn after_completion(&self, outcome: Outcome);
}

/// Lets a participant ask for the outcome of its branch after a failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecoveryHandle {
    pub global_tid: GlobalTid,
    pub participant: String,
}

/// Resources available to drive recovered transactions, keyed by name.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: DashMap<String, Arc<dyn Participant>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, participant: Arc<dyn Participant>) {
        self.resources.insert(participant.name(), participant);
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Participant>> {
        self.resources.remove(name).map(|(_, participant)| participant)
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Participant>> {
        self.resources.get(name).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
