//! Extent management.
//!
//! A log is stored as a sequence of fixed-size extent files. Logical extent
//! numbers grow without bound, physical files are reused modulo the extent
//! radix (`extent.000` … `extent.NNN`). Each open extent remembers the last
//! kind of access and the position of its read and write cursors so that
//! sequential appends and sequential scans never issue a redundant seek.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{LogError, LogResult};
use crate::lsn::Lsn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastAccess {
    None,
    Read,
    Write,
}

struct Extent {
    file: File,
    last_access: LastAccess,
    read_position: u64,
    write_position: u64,
    /// Appended bytes not yet handed to the file.
    pending: Vec<u8>,
    pending_offset: u64,
    /// Written to the file but not yet synced.
    unsynced: bool,
}

impl Extent {
    fn new(file: File) -> Self {
        Self {
            file,
            last_access: LastAccess::None,
            read_position: 0,
            write_position: 0,
            pending: Vec::new(),
            pending_offset: 0,
            unsynced: false,
        }
    }

    fn flush_pending(&mut self) -> LogResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if self.last_access != LastAccess::Write || self.write_position != self.pending_offset {
            self.file.seek(SeekFrom::Start(self.pending_offset))?;
        }
        self.file.write_all(&self.pending)?;
        self.write_position = self.pending_offset + self.pending.len() as u64;
        self.last_access = LastAccess::Write;
        self.pending.clear();
        self.unsynced = true;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> LogResult<()> {
        self.flush_pending()?;
        if self.last_access != LastAccess::Read || self.read_position != offset {
            self.file.seek(SeekFrom::Start(offset))?;
        }
        self.last_access = LastAccess::Read;
        match self.file.read_exact(buf) {
            Ok(()) => {
                self.read_position = offset + buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                // The file position is unknown after a short read.
                self.last_access = LastAccess::None;
                Err(LogError::Io(e))
            }
        }
    }
}

pub struct ExtentManager {
    dir: PathBuf,
    extent_size: u64,
    radix: u32,
    read_only: bool,
    extents: BTreeMap<u32, Extent>,
}

impl ExtentManager {
    pub fn new(dir: &Path, extent_size: u64, radix: u32) -> Self {
        Self {
            dir: dir.to_path_buf(),
            extent_size,
            radix: radix.max(2),
            read_only: false,
            extents: BTreeMap::new(),
        }
    }

    /// Opens existing extent files without write access.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn extent_size(&self) -> u64 {
        self.extent_size
    }

    pub fn radix(&self) -> u32 {
        self.radix
    }

    /// Path of the physical file backing logical extent `extent`.
    pub fn file_name(&self, extent: u32) -> PathBuf {
        self.dir.join(format!("extent.{:03}", extent % self.radix))
    }

    /// Prepares a brand new extent for writing.
    ///
    /// Fails with [`LogError::LogFull`] when the extent would share its
    /// physical file with an extent that is still live (at or after `tail_extent`).
    pub fn create_extent(&mut self, extent: u32, tail_extent: u32) -> LogResult<()> {
        if extent.wrapping_sub(tail_extent) >= self.radix {
            return Err(LogError::LogFull { extent });
        }
        self.extents.remove(&extent);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(self.file_name(extent))?;
        debug!(extent, path = ?self.file_name(extent), "log extent created");
        self.extents.insert(extent, Extent::new(file));
        Ok(())
    }

    fn open_existing(&mut self, extent: u32) -> LogResult<&mut Extent> {
        if !self.extents.contains_key(&extent) {
            let file = OpenOptions::new()
                .read(true)
                .write(!self.read_only)
                .open(self.file_name(extent))?;
            self.extents.insert(extent, Extent::new(file));
        }
        self.extents
            .get_mut(&extent)
            .ok_or_else(|| LogError::InvalidLsn(Lsn::new(extent, 0)))
    }

    /// Buffers `bytes` for writing at `lsn`. Nothing reaches the file until
    /// [`ExtentManager::flush`] is called or the extent is read.
    pub fn write(&mut self, lsn: Lsn, bytes: &[u8]) -> LogResult<()> {
        let offset = lsn.offset() as u64;
        if offset + bytes.len() as u64 > self.extent_size {
            return Err(LogError::RecordTooLarge {
                size: bytes.len(),
                extent_size: self.extent_size,
            });
        }
        let extent = self.open_existing(lsn.extent())?;
        if !extent.pending.is_empty()
            && extent.pending_offset + extent.pending.len() as u64 != offset
        {
            extent.flush_pending()?;
        }
        if extent.pending.is_empty() {
            extent.pending_offset = offset;
        }
        extent.pending.extend_from_slice(bytes);
        Ok(())
    }

    /// Hands every buffered append to the operating system and, when `sync`
    /// is set, waits until the data is durable.
    pub fn flush(&mut self, sync: bool) -> LogResult<()> {
        for extent in self.extents.values_mut() {
            extent.flush_pending()?;
            if sync && extent.unsynced {
                extent.file.sync_data()?;
                extent.unsynced = false;
            }
        }
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes starting at `lsn`.
    pub fn read(&mut self, lsn: Lsn, buf: &mut [u8]) -> LogResult<()> {
        if lsn.offset() as u64 + buf.len() as u64 > self.extent_size {
            return Err(LogError::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "read past the end of the extent",
            )));
        }
        let extent = self.open_existing(lsn.extent())?;
        extent.read_at(lsn.offset() as u64, buf)
    }

    /// Removes the files of logical extents in `from..to`.
    pub fn delete_range(&mut self, from: u32, to: u32) -> LogResult<()> {
        let mut extent = from;
        while extent != to {
            self.extents.remove(&extent);
            match fs::remove_file(self.file_name(extent)) {
                Ok(()) => debug!(extent, "log extent deleted"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(LogError::Io(e)),
            }
            extent = extent.wrapping_add(1);
        }
        Ok(())
    }

    /// Closes every open handle except the one of `keep`.
    pub fn release_handles(&mut self, keep: u32) -> LogResult<()> {
        self.flush(true)?;
        self.extents.retain(|number, _| *number == keep);
        Ok(())
    }

    pub fn open_count(&self) -> usize {
        self.extents.len()
    }

    pub fn close_all(&mut self) -> LogResult<()> {
        self.flush(true)?;
        self.extents.clear();
        Ok(())
    }

    /// Drops every handle together with appends that were never handed to
    /// the file.
    pub fn discard(&mut self) {
        let pending: usize = self.extents.values().map(|e| e.pending.len()).sum();
        if pending > 0 {
            debug!(pending, "discarding buffered log bytes");
        }
        self.extents.clear();
    }
}
