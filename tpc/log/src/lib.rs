//! Write-ahead log used by the transaction coordinator.
//!
//! A log is a chain of variable-length records stored in fixed-size extent
//! files. Every record is framed by a header and an ending that both carry
//! the record's LSN, so torn records are detected when read back.

pub mod config;
pub mod control;
pub mod cursor;
pub mod error;
pub mod extent;
pub mod log;
pub mod lsn;
pub mod pool;
pub mod record;
mod restart;

use std::fmt::Debug;

pub use config::LogConfig;
pub use control::ControlDescriptor;
pub use cursor::{LogCursor, LogEntry, LogIter, ScanDirection};
pub use error::{LogError, LogResult};
pub use log::{Log, WriteMode};
pub use lsn::Lsn;
pub use pool::LogPool;
pub use record::RecordType;

/// A payload that can be stored in a log record.
pub trait LogRecord: Sized + Debug {
    fn to_bytes(&self) -> LogResult<Vec<u8>>;

    fn from_bytes(bytes: &[u8]) -> LogResult<Self>;
}
