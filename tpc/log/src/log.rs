//! A single named log instance.
//!
//! All state of a log lives behind one mutex: appends, flushes, cursor reads
//! and truncation are serialized per instance. Different log instances share
//! nothing.
//!
//! A fatal error while changing the log fails the instance. Buffered records
//! that were not yet durable are dropped and every later call returns
//! [`LogError::Failed`]; only reopening the log (which replays whatever
//! reached disk) brings it back.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::LogConfig;
use crate::control::{ControlDescriptor, ControlFile};
use crate::cursor::{LogCursor, LogEntry, LogIter, ScanDirection};
use crate::error::{LogError, LogResult};
use crate::extent::ExtentManager;
use crate::lsn::Lsn;
use crate::record::{
    ENDING_SIZE, HEADER_SIZE, LINK_RECORD_SIZE, RECORD_OVERHEAD, RecordEnding, RecordHeader,
    RecordType, encode_record,
};
use crate::restart::RestartArea;

const SCRATCH_CAPACITY: usize = 4096;

/// Durability requested for an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// The record and everything before it are durable when `write` returns.
    Forced,
    /// The record is durable only after a later forced write or flush.
    Buffered,
}

struct LogInner {
    control: ControlDescriptor,
    control_file: ControlFile,
    extents: ExtentManager,
    restart: RestartArea,
    scratch: Vec<u8>,
    /// Appends since the control descriptor was last persisted.
    unforced: usize,
    closed: bool,
    failed: bool,
    read_only: bool,
}

pub struct Log {
    name: String,
    dir: PathBuf,
    inner: Mutex<LogInner>,
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Log {
    /// Opens the log called `name` under `config.base_dir`, creating it when
    /// it does not exist yet.
    ///
    /// Records that were flushed to an extent after the control file was last
    /// persisted are adopted by following the chain forward from `head`.
    pub fn open(config: &LogConfig, name: &str) -> LogResult<Self> {
        Self::open_with(config, name, false)
    }

    /// Opens an existing log for inspection only.
    ///
    /// Nothing under the log directory is created or modified: records found
    /// past the persisted head are adopted in memory only, and every call
    /// that would change the log fails with [`LogError::ReadOnly`].
    pub fn open_read_only(config: &LogConfig, name: &str) -> LogResult<Self> {
        Self::open_with(config, name, true)
    }

    fn open_with(config: &LogConfig, name: &str, read_only: bool) -> LogResult<Self> {
        config.validate()?;
        let dir = config.base_dir.join(name);
        let control_file = ControlFile::new(&dir);
        if read_only && !control_file.exists() {
            return Err(LogError::Io(io::Error::new(
                ErrorKind::NotFound,
                format!("no control file in {}", dir.display()),
            )));
        }
        if !read_only {
            fs::create_dir_all(&dir)?;
        }

        let fresh = !control_file.exists();
        let control = if fresh {
            let descriptor = ControlDescriptor::default();
            control_file.store(&descriptor)?;
            descriptor
        } else {
            control_file.load()?
        };

        let mut extents = ExtentManager::new(&dir, config.extent_size, config.extent_radix);
        if read_only {
            extents = extents.read_only();
        }
        let mut inner = LogInner {
            control,
            control_file,
            extents,
            restart: RestartArea::open(&dir)?,
            scratch: Vec::with_capacity(SCRATCH_CAPACITY),
            unforced: 0,
            closed: false,
            failed: false,
            read_only,
        };

        if !fresh {
            let adopted = inner.adopt_unrecorded();
            if adopted > 0 && !read_only {
                inner.control_file.store(&inner.control)?;
            }
            if adopted > 0 {
                info!(
                    log = name,
                    adopted,
                    read_only,
                    "adopted records written after the last control update"
                );
            }
        }

        info!(
            log = name,
            head = %inner.control.head,
            tail = %inner.control.tail,
            next = %inner.control.next,
            read_only,
            "log opened"
        );

        Ok(Self {
            name: name.to_string(),
            dir,
            inner: Mutex::new(inner),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn control(&self) -> ControlDescriptor {
        self.inner.lock().control
    }

    /// LSN of the most recently written record, or [`Lsn::NULL`].
    pub fn head(&self) -> Lsn {
        self.inner.lock().control.head
    }

    /// LSN of the oldest record still needed.
    pub fn tail(&self) -> Lsn {
        self.inner.lock().control.tail
    }

    /// Address the next record will be written to.
    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().control.next
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().control.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// True once a fatal error made this instance refuse further work.
    pub fn is_failed(&self) -> bool {
        self.inner.lock().failed
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.lock().read_only
    }

    /// Appends a record and returns its LSN.
    ///
    /// LSNs returned by successive writes on one instance are strictly
    /// increasing. A forced write also makes every earlier record durable.
    pub fn write(&self, data: &[u8], record_type: RecordType, mode: WriteMode) -> LogResult<Lsn> {
        if record_type == RecordType::Link {
            return Err(LogError::ReservedRecordType(record_type));
        }
        let mut inner = self.inner.lock();
        inner.ensure_writable(&self.name)?;

        let result = inner.append(record_type, data).and_then(|lsn| match mode {
            WriteMode::Forced => inner.force().map(|()| lsn),
            WriteMode::Buffered => {
                inner.unforced += 1;
                Ok(lsn)
            }
        });
        let lsn = inner.fail_on_fatal(&self.name, result)?;
        trace!(log = %self.name, %lsn, ?record_type, len = data.len(), ?mode, "log record written");
        Ok(lsn)
    }

    /// Makes every record written so far durable.
    pub fn flush(&self) -> LogResult<()> {
        let mut inner = self.inner.lock();
        inner.ensure_writable(&self.name)?;
        let result = inner.force();
        inner.fail_on_fatal(&self.name, result)
    }

    /// Forces the log and discards every record before `first_needed`.
    ///
    /// [`Lsn::HEAD`] keeps only the most recent record, [`Lsn::TAIL`] keeps
    /// everything.
    pub fn checkpoint(&self, first_needed: Lsn) -> LogResult<()> {
        let mut inner = self.inner.lock();
        inner.ensure_writable(&self.name)?;
        let result = inner.force().and_then(|()| {
            if inner.control.is_empty() {
                return Ok(());
            }
            let target = inner.control.resolve(first_needed);
            inner.truncate_to(&self.name, target)
        });
        inner.fail_on_fatal(&self.name, result)
    }

    /// Discards every record before `first_needed`. Passing [`Lsn::HEAD`]
    /// discards the whole log.
    ///
    /// Whole extents entirely before the new tail are deleted. The tail never
    /// moves backwards.
    pub fn truncate(&self, first_needed: Lsn) -> LogResult<()> {
        let mut inner = self.inner.lock();
        inner.ensure_writable(&self.name)?;
        let target = match first_needed {
            Lsn::HEAD => inner.control.next,
            Lsn::TAIL => return Ok(()),
            other => other,
        };
        let result = inner
            .force()
            .and_then(|()| inner.truncate_to(&self.name, target));
        inner.fail_on_fatal(&self.name, result)
    }

    /// Stores `data` as the restart record after forcing the log.
    pub fn write_restart(&self, data: &[u8]) -> LogResult<()> {
        let mut inner = self.inner.lock();
        inner.ensure_writable(&self.name)?;
        let result = inner.force().and_then(|()| inner.restart.write(data));
        inner.fail_on_fatal(&self.name, result)
    }

    /// Returns the most recent intact restart record.
    pub fn read_restart(&self) -> LogResult<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        inner.ensure_open(&self.name)?;
        inner.restart.read()
    }

    /// Opens a cursor from `start` to `end`, both inclusive. The scan is
    /// ascending when `start <= end` and descending otherwise. Sentinels
    /// resolve against the current control descriptor.
    pub fn open_cursor(&self, start: Lsn, end: Lsn) -> LogResult<LogCursor> {
        let inner = self.inner.lock();
        inner.ensure_open(&self.name)?;
        if inner.control.is_empty() {
            return Ok(LogCursor::exhausted());
        }
        let start = inner.control.resolve(start);
        let end = inner.control.resolve(end);
        for lsn in [start, end] {
            if lsn < inner.control.tail || lsn > inner.control.head {
                return Err(LogError::InvalidLsn(lsn));
            }
        }
        Ok(LogCursor::new(start, end))
    }

    /// Reads the next record of `cursor`, skipping link records. Returns
    /// `None` once the cursor passed its end.
    pub fn read_cursor(&self, cursor: &mut LogCursor) -> LogResult<Option<LogEntry>> {
        let mut inner = self.inner.lock();
        inner.ensure_open(&self.name)?;
        loop {
            let Some(at) = cursor.position else {
                return Ok(None);
            };
            // Truncated underneath the cursor.
            if at < inner.control.tail || at > inner.control.head {
                cursor.position = None;
                return Ok(None);
            }

            let (header, data) = inner.read_record(at)?;
            cursor.position = if at == cursor.end {
                None
            } else {
                match cursor.direction {
                    ScanDirection::Ascending => {
                        Some(header.next).filter(|next| *next <= cursor.end)
                    }
                    ScanDirection::Descending => Some(header.previous)
                        .filter(|previous| !previous.is_null() && *previous >= cursor.end),
                }
            };

            if header.record_type == RecordType::Link {
                continue;
            }
            return Ok(Some(LogEntry {
                record_type: header.record_type,
                data,
                lsn: at,
            }));
        }
    }

    /// Iterates records from `start` to `end`.
    pub fn entries(&self, start: Lsn, end: Lsn) -> LogResult<LogIter<'_>> {
        Ok(LogIter::new(self, self.open_cursor(start, end)?))
    }

    /// Returns the records a restarting process must replay.
    ///
    /// The last completed keypoint (a start marker followed by an end marker)
    /// splits the log: normal records after its start marker are returned
    /// together with the rewrite records between its start marker and any
    /// later, incomplete keypoint. Markers are never returned, and rewrites of
    /// an incomplete keypoint are ignored.
    ///
    /// Any corruption between tail and head is returned as an error.
    pub fn recovery_records(&self) -> LogResult<Vec<LogEntry>> {
        let entries = self
            .entries(Lsn::TAIL, Lsn::HEAD)?
            .collect::<LogResult<Vec<_>>>()?;

        let mut completed_start = Lsn::NULL;
        let mut open_start: Option<Lsn> = None;
        for entry in &entries {
            match entry.record_type {
                RecordType::KeypointStart => open_start = Some(entry.lsn),
                RecordType::KeypointEnd => {
                    if let Some(start) = open_start.take() {
                        completed_start = start;
                    }
                }
                _ => {}
            }
        }
        let rewrite_limit = open_start.unwrap_or(Lsn::HEAD);

        let records: Vec<LogEntry> = entries
            .into_iter()
            .filter(|entry| match entry.record_type {
                RecordType::Normal => entry.lsn > completed_start,
                RecordType::Rewrite => {
                    entry.lsn > completed_start && entry.lsn < rewrite_limit
                }
                _ => false,
            })
            .collect();
        debug!(
            log = %self.name,
            keypoint = %completed_start,
            count = records.len(),
            "recovery records collected"
        );
        Ok(records)
    }

    /// Clears per-use state so the instance can be handed out again: flushes
    /// buffered records, drops idle extent handles and shrinks the scratch
    /// buffer.
    pub fn reset(&self) -> LogResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed || inner.failed || inner.read_only {
            return Ok(());
        }
        let current = inner.control.next.extent();
        let result = inner
            .force()
            .and_then(|()| inner.extents.release_handles(current));
        inner.fail_on_fatal(&self.name, result)?;
        inner.scratch.clear();
        inner.scratch.shrink_to(SCRATCH_CAPACITY);
        Ok(())
    }

    /// Closes the log. With `delete_files` the whole log directory is
    /// removed, otherwise every buffered record is made durable first.
    pub fn close(&self, delete_files: bool) -> LogResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        if inner.failed || inner.read_only {
            inner.extents.discard();
            if !delete_files {
                info!(log = %self.name, failed = inner.failed, "log closed without flushing");
                return Ok(());
            }
        }
        if delete_files {
            inner.extents.close_all()?;
            match fs::remove_dir_all(&self.dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(LogError::Io(e)),
            }
            info!(log = %self.name, "log closed and deleted");
        } else {
            inner.force()?;
            inner.extents.close_all()?;
            info!(log = %self.name, head = %inner.control.head, "log closed");
        }
        Ok(())
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.closed || inner.failed || inner.unforced == 0 {
            return;
        }
        if let Err(e) = inner.force() {
            warn!(log = %self.name, error = %e, "failed to flush log on drop");
        }
    }
}

impl LogInner {
    fn ensure_open(&self, name: &str) -> LogResult<()> {
        if self.closed {
            return Err(LogError::Closed(name.to_string()));
        }
        if self.failed {
            return Err(LogError::Failed(name.to_string()));
        }
        Ok(())
    }

    fn ensure_writable(&self, name: &str) -> LogResult<()> {
        self.ensure_open(name)?;
        if self.read_only {
            return Err(LogError::ReadOnly(name.to_string()));
        }
        Ok(())
    }

    /// Fails the instance when `result` carries a fatal error. Appends that
    /// never became durable are discarded so no later flush can persist a
    /// record whose write was reported as failed.
    fn fail_on_fatal<T>(&mut self, name: &str, result: LogResult<T>) -> LogResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() && !self.failed {
                self.failed = true;
                self.extents.discard();
                error!(log = name, error = %e, "log failed, refusing further operations");
            }
        }
        result
    }

    fn force(&mut self) -> LogResult<()> {
        self.extents.flush(true)?;
        self.control_file.store(&self.control)?;
        self.unforced = 0;
        Ok(())
    }

    fn append(&mut self, record_type: RecordType, data: &[u8]) -> LogResult<Lsn> {
        let extent_size = self.extents.extent_size();
        let size = RECORD_OVERHEAD + data.len();
        if (size + LINK_RECORD_SIZE) as u64 > extent_size {
            return Err(LogError::RecordTooLarge {
                size: data.len(),
                extent_size,
            });
        }

        if self.control.next.offset() == 0 {
            self.extents
                .create_extent(self.control.next.extent(), self.control.tail.extent())?;
        }
        // Always leave room for a link record at the end of the extent.
        if self.control.next.offset() as u64 + (size + LINK_RECORD_SIZE) as u64 > extent_size {
            self.append_link()?;
        }

        let next = self.control.next.advance(size);
        self.append_raw(record_type, data, next)
    }

    fn append_link(&mut self) -> LogResult<()> {
        let at = self.control.next;
        let following = at.next_extent();
        self.extents
            .create_extent(following.extent(), self.control.tail.extent())?;
        self.append_raw(RecordType::Link, &[], following)?;
        debug!(%at, extent = following.extent(), "log continued in next extent");
        Ok(())
    }

    fn append_raw(&mut self, record_type: RecordType, data: &[u8], next: Lsn) -> LogResult<Lsn> {
        let lsn = self.control.next;
        let header = RecordHeader {
            record_type,
            current: lsn,
            previous: self.control.head,
            next,
            length: data.len() as u32,
        };
        self.scratch.clear();
        encode_record(&mut self.scratch, &header, data);
        self.extents.write(lsn, &self.scratch)?;
        self.control.head = lsn;
        self.control.next = next;
        Ok(lsn)
    }

    fn read_record(&mut self, at: Lsn) -> LogResult<(RecordHeader, Vec<u8>)> {
        let mut raw_header = [0u8; HEADER_SIZE];
        self.extents.read(at, &mut raw_header)?;
        let header = RecordHeader::decode(&raw_header, at)?;

        if at.offset() as u64 + header.record_size() as u64 > self.extents.extent_size() {
            return Err(LogError::corrupt(at, "record length runs past the extent"));
        }
        let expected_next = if header.record_type == RecordType::Link {
            at.next_extent()
        } else {
            at.advance(header.record_size())
        };
        if header.next != expected_next {
            return Err(LogError::corrupt(at, "next LSN does not follow the record"));
        }

        let mut data = vec![0u8; header.length as usize];
        self.extents.read(at.advance(HEADER_SIZE), &mut data)?;

        let mut raw_ending = [0u8; ENDING_SIZE];
        self.extents
            .read(at.advance(HEADER_SIZE + data.len()), &mut raw_ending)?;
        let ending = RecordEnding::decode(&raw_ending, at)?;
        if ending.current != header.current {
            return Err(LogError::corrupt(at, "record ending does not match its header"));
        }
        Ok((header, data))
    }

    /// Follows the chain past `head` and adopts every intact record whose
    /// back pointer matches. Stops silently at the first record that does
    /// not read back cleanly.
    fn adopt_unrecorded(&mut self) -> usize {
        let mut adopted = 0;
        loop {
            let at = self.control.next;
            match self.read_record(at) {
                Ok((header, _)) if header.previous == self.control.head => {
                    self.control.head = at;
                    self.control.next = header.next;
                    adopted += 1;
                }
                Ok(_) => break,
                Err(e) => {
                    trace!(%at, error = %e, "forward scan stopped");
                    break;
                }
            }
        }
        adopted
    }

    fn truncate_to(&mut self, name: &str, first_needed: Lsn) -> LogResult<()> {
        if first_needed <= self.control.tail {
            return Ok(());
        }
        if first_needed > self.control.next {
            return Err(LogError::InvalidLsn(first_needed));
        }
        let old_tail = self.control.tail;
        self.control.tail = first_needed;
        self.control_file.store(&self.control)?;
        self.extents
            .delete_range(old_tail.extent(), first_needed.extent())?;
        info!(log = name, from = %old_tail, to = %first_needed, "log truncated");
        Ok(())
    }
}
