use crate::error::LogResult;
use crate::log::Log;
use crate::lsn::Lsn;
use crate::record::RecordType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Ascending,
    Descending,
}

/// Position of a sequential scan over a log.
///
/// A cursor is plain data; records are fetched with [`Log::read_cursor`],
/// which serializes with writers on the log's mutex.
#[derive(Debug, Clone)]
pub struct LogCursor {
    pub(crate) position: Option<Lsn>,
    pub(crate) end: Lsn,
    pub(crate) direction: ScanDirection,
}

impl LogCursor {
    pub(crate) fn new(start: Lsn, end: Lsn) -> Self {
        let direction = if start <= end {
            ScanDirection::Ascending
        } else {
            ScanDirection::Descending
        };
        Self {
            position: Some(start),
            end,
            direction,
        }
    }

    pub(crate) fn exhausted() -> Self {
        Self {
            position: None,
            end: Lsn::NULL,
            direction: ScanDirection::Ascending,
        }
    }

    pub fn direction(&self) -> ScanDirection {
        self.direction
    }

    pub fn is_exhausted(&self) -> bool {
        self.position.is_none()
    }
}

/// A record surfaced by a cursor. Link records are never returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub record_type: RecordType,
    pub data: Vec<u8>,
    pub lsn: Lsn,
}

/// Iterator adapter over a cursor.
pub struct LogIter<'a> {
    log: &'a Log,
    cursor: LogCursor,
    failed: bool,
}

impl<'a> LogIter<'a> {
    pub(crate) fn new(log: &'a Log, cursor: LogCursor) -> Self {
        Self {
            log,
            cursor,
            failed: false,
        }
    }
}

impl Iterator for LogIter<'_> {
    type Item = LogResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.log.read_cursor(&mut self.cursor) {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
