use thiserror::Error;

use crate::lsn::Lsn;

pub type LogResult<T> = Result<T, LogError>;

/// Errors raised by a log instance.
///
/// The log never retries a failed read or write on its own. A fatal error
/// (see [`LogError::is_fatal`]) raised while changing the log fails the
/// instance: every later operation returns [`LogError::Failed`] until the log
/// is reopened.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt log record at {lsn}: {detail}")]
    Corrupt { lsn: Lsn, detail: String },
    #[error("control file checksum mismatch")]
    ChecksumMismatch,
    #[error("serialization failed: {0}")]
    SerializationFailed(String),
    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),
    #[error("record of {size} bytes does not fit in an extent of {extent_size} bytes")]
    RecordTooLarge { size: usize, extent_size: u64 },
    #[error("log is full: extent {extent} would reuse a live extent slot")]
    LogFull { extent: u32 },
    #[error("LSN {0} is outside the live portion of the log")]
    InvalidLsn(Lsn),
    #[error("record type {0:?} cannot be written directly")]
    ReservedRecordType(crate::record::RecordType),
    #[error("log {0} is closed")]
    Closed(String),
    #[error("log {0} is open read-only")]
    ReadOnly(String),
    #[error("log {0} failed earlier and must be reopened")]
    Failed(String),
    #[error("invalid log configuration: {0}")]
    InvalidConfig(String),
}

impl LogError {
    /// True for errors that leave the on-disk state of the log unknown.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LogError::Io(_) | LogError::Corrupt { .. } | LogError::ChecksumMismatch
        )
    }

    pub(crate) fn corrupt(lsn: Lsn, detail: impl Into<String>) -> Self {
        LogError::Corrupt {
            lsn,
            detail: detail.into(),
        }
    }
}
