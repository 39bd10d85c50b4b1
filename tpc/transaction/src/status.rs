//! Transaction status, participant votes and heuristic outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::Display;

/// Phase of a coordinator.
///
/// Phases only ever move forward:
/// `Active → Preparing → Prepared → {Committing → Committed | RollingBack → RolledBack}`.
/// `HeuristicallyCompleted` is terminal and reachable whenever a participant
/// reports a heuristic outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    HeuristicallyCompleted(HeuristicOutcome),
    /// The decision is not available yet.
    Unknown,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Committed | Status::RolledBack | Status::HeuristicallyCompleted(_)
        )
    }

    /// Collapses a coordinator status into the answer given to a participant
    /// asking for the outcome of its branch.
    pub fn replay_outcome(self, decision: Option<Outcome>) -> Status {
        match self {
            Status::Committing | Status::Committed => Status::Committed,
            Status::RollingBack | Status::RolledBack => Status::RolledBack,
            Status::HeuristicallyCompleted(_) | Status::Prepared => match decision {
                Some(Outcome::Committed) => Status::Committed,
                Some(Outcome::RolledBack) => Status::RolledBack,
                None => Status::Unknown,
            },
            Status::Active | Status::Preparing | Status::Unknown => Status::Unknown,
        }
    }
}

/// Answer of a participant to `prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum Vote {
    Commit,
    Rollback,
    ReadOnly,
}

/// Final decision of a transaction, as seen by synchronizations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum Outcome {
    Committed,
    RolledBack,
}

/// Heuristic decision reported by a single participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum HeuristicKind {
    Commit,
    Rollback,
    Mixed,
    Hazard,
}

/// Heuristic outcome of a whole transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum HeuristicOutcome {
    /// Some participants provably diverged from the decision.
    Mixed,
    /// Some participants may have diverged from the decision.
    Hazard,
}

/// Names the participants whose outcome may differ from the decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeuristicReport {
    pub decision: Option<Outcome>,
    /// Participants that committed although the decision was rollback, or
    /// rolled back although the decision was commit.
    pub diverged: Vec<String>,
    /// Participants that reported a mixed outcome of their own.
    pub mixed: Vec<String>,
    /// Participants whose outcome is unknown.
    pub hazard: Vec<String>,
}

impl HeuristicReport {
    pub fn new(decision: Outcome) -> Self {
        Self {
            decision: Some(decision),
            ..Self::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.diverged.is_empty() && self.mixed.is_empty() && self.hazard.is_empty()
    }

    /// Records the heuristic decision `kind` taken by `participant`.
    pub fn record(&mut self, participant: &str, kind: HeuristicKind) {
        let matches_decision = matches!(
            (self.decision, kind),
            (Some(Outcome::Committed), HeuristicKind::Commit)
                | (Some(Outcome::RolledBack), HeuristicKind::Rollback)
        );
        let target = match kind {
            _ if matches_decision => return,
            HeuristicKind::Commit | HeuristicKind::Rollback => &mut self.diverged,
            HeuristicKind::Mixed => &mut self.mixed,
            HeuristicKind::Hazard => &mut self.hazard,
        };
        target.push(participant.to_string());
    }

    pub fn outcome(&self) -> Option<HeuristicOutcome> {
        if !self.diverged.is_empty() || !self.mixed.is_empty() {
            Some(HeuristicOutcome::Mixed)
        } else if !self.hazard.is_empty() {
            Some(HeuristicOutcome::Hazard)
        } else {
            None
        }
    }
}

impl fmt::Display for HeuristicReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decision {
            Some(decision) => write!(f, "decision {decision}")?,
            None => write!(f, "no decision")?,
        }
        for (label, names) in [
            ("diverged", &self.diverged),
            ("mixed", &self.mixed),
            ("hazard", &self.hazard),
        ] {
            if !names.is_empty() {
                write!(f, ", {label}: [{}]", names.join(", "))?;
            }
        }
        Ok(())
    }
}
