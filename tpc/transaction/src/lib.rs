//! Two-phase commit coordination.
//!
//! A [`TransactionService`] hands out transactions, drives their
//! participants through prepare and commit or rollback, records decisions
//! in a write-ahead log and resolves unfinished transactions after a
//! restart. Imported transactions are completed through the
//! [`XaTerminator`].

pub mod coordinator;
pub mod error;
pub mod event;
pub mod freeze;
pub mod journal;
pub mod participant;
pub mod record;
pub mod recovery;
pub mod service;
pub mod status;
pub mod table;
pub mod terminator;
pub mod tid;
pub mod xa;

pub use coordinator::Coordinator;
pub use error::{
    ParticipantError, ParticipantResult, TransactionError, TransactionResult, XaError, XaResult,
};
pub use event::EventSemaphore;
pub use freeze::FreezeGate;
pub use participant::{Participant, RecoveryHandle, ResourceRegistry, Synchronization};
pub use recovery::{RecoveredTransaction, RecoveryManager};
pub use service::{TransactionHandle, TransactionService, TransactionServiceConfig};
pub use status::{HeuristicKind, HeuristicOutcome, HeuristicReport, Outcome, Status, Vote};
pub use terminator::CompletionDriver;
pub use tid::{GlobalTid, LocalTid, Xid};
pub use xa::{XaTerminator, XaVote};
