use thiserror::Error;
use tpc_log::LogError;

use crate::status::{HeuristicKind, HeuristicReport, Status};

pub type TransactionResult<T> = Result<T, TransactionError>;

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("{operation} is not allowed while the transaction is {status}")]
    ProtocolViolation {
        operation: &'static str,
        status: Status,
    },

    #[error("transaction rolled back: {cause}")]
    RolledBack { cause: String },

    #[error("heuristic mixed outcome ({0})")]
    HeuristicMixed(HeuristicReport),

    #[error("heuristic hazard outcome ({0})")]
    HeuristicHazard(HeuristicReport),

    /// Failure of the coordinator log. The outcome of the affected
    /// transaction is unknown until recovery runs.
    #[error("coordinator log failure: {0}")]
    Log(#[from] LogError),

    #[error("unknown transaction {0}")]
    UnknownTransaction(String),

    #[error("local transaction id overflow, reached {0}")]
    TidOverflow(u64),

    #[error("transaction service is shut down")]
    ServiceShutDown,

    #[error("failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        source: std::io::Error,
    },
}

impl TransactionError {
    pub(crate) fn protocol(operation: &'static str, status: Status) -> Self {
        TransactionError::ProtocolViolation { operation, status }
    }

    pub(crate) fn rolled_back(cause: impl Into<String>) -> Self {
        TransactionError::RolledBack {
            cause: cause.into(),
        }
    }

    pub fn is_heuristic(&self) -> bool {
        matches!(
            self,
            TransactionError::HeuristicMixed(_) | TransactionError::HeuristicHazard(_)
        )
    }
}

pub type ParticipantResult<T> = Result<T, ParticipantError>;

/// Failures a participant or synchronization reports back to the coordinator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParticipantError {
    /// The participant already completed its branch on its own.
    #[error("participant took a heuristic {0} decision")]
    Heuristic(HeuristicKind),

    #[error("participant rolled back its branch")]
    RolledBack,

    #[error("participant was asked to complete a branch it never prepared")]
    NotPrepared,

    #[error("participant failure: {0}")]
    Failure(String),
}

pub type XaResult<T> = Result<T, XaError>;

/// Errors of the XA terminator, carrying the X/Open return codes.
#[derive(Error, Debug)]
pub enum XaError {
    #[error("XAER_NOTA: unknown transaction branch {0}")]
    NoTransaction(String),

    #[error("XAER_INVAL: {0}")]
    InvalidArguments(String),

    #[error("XAER_PROTO: {0}")]
    Protocol(String),

    #[error("XAER_RMERR: {0}")]
    ResourceManager(String),

    #[error("XA_RBROLLBACK: {0}")]
    RolledBack(String),

    #[error("XA_HEURMIX: {0}")]
    HeuristicMixed(HeuristicReport),

    #[error("XA_HEURHAZ: {0}")]
    HeuristicHazard(HeuristicReport),
}

impl XaError {
    pub const XA_HEURHAZ: i32 = 8;
    pub const XA_HEURMIX: i32 = 5;
    pub const XA_RBROLLBACK: i32 = 100;
    pub const XAER_INVAL: i32 = -5;
    pub const XAER_NOTA: i32 = -4;
    pub const XAER_PROTO: i32 = -6;
    pub const XAER_RMERR: i32 = -3;

    pub fn code(&self) -> i32 {
        match self {
            XaError::NoTransaction(_) => Self::XAER_NOTA,
            XaError::InvalidArguments(_) => Self::XAER_INVAL,
            XaError::Protocol(_) => Self::XAER_PROTO,
            XaError::ResourceManager(_) => Self::XAER_RMERR,
            XaError::RolledBack(_) => Self::XA_RBROLLBACK,
            XaError::HeuristicMixed(_) => Self::XA_HEURMIX,
            XaError::HeuristicHazard(_) => Self::XA_HEURHAZ,
        }
    }
}

impl From<TransactionError> for XaError {
    fn from(e: TransactionError) -> Self {
        match e {
            TransactionError::ProtocolViolation { .. } => XaError::Protocol(e.to_string()),
            TransactionError::RolledBack { cause } => XaError::RolledBack(cause),
            TransactionError::HeuristicMixed(report) => XaError::HeuristicMixed(report),
            TransactionError::HeuristicHazard(report) => XaError::HeuristicHazard(report),
            TransactionError::UnknownTransaction(tid) => XaError::NoTransaction(tid),
            other => XaError::ResourceManager(other.to_string()),
        }
    }
}
