//! Records the coordinator writes to its log.

use serde::{Deserialize, Serialize};
use tpc_log::{LogError, LogRecord, LogResult};

use crate::status::{HeuristicOutcome, Outcome};
use crate::tid::GlobalTid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorRecord {
    /// A subordinate voted commit; the outcome belongs to its superior.
    Prepared {
        global_tid: GlobalTid,
        participants: Vec<String>,
    },
    /// The outcome is decided; `participants` still have to be told.
    Decided {
        global_tid: GlobalTid,
        outcome: Outcome,
        participants: Vec<String>,
    },
    /// Every participant was told; nothing is left to recover.
    Completed {
        global_tid: GlobalTid,
        heuristic: Option<HeuristicOutcome>,
    },
}

impl CoordinatorRecord {
    pub fn global_tid(&self) -> &GlobalTid {
        match self {
            CoordinatorRecord::Prepared { global_tid, .. }
            | CoordinatorRecord::Decided { global_tid, .. }
            | CoordinatorRecord::Completed { global_tid, .. } => global_tid,
        }
    }
}

impl LogRecord for CoordinatorRecord {
    fn to_bytes(&self) -> LogResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| LogError::SerializationFailed(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> LogResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| LogError::DeserializationFailed(e.to_string()))
    }
}
