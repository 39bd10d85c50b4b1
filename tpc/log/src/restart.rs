//! Restart records.
//!
//! Restart data is kept outside the record chain in two alternating slots
//! (`restart.1`, `restart.2`). A slot is written with its `valid` marker
//! cleared, synced, and only then marked valid, so a crash in the middle of a
//! restart write leaves the other slot untouched.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{LogError, LogResult};
use crate::record::{RESTART_HEADER_SIZE, RESTART_VALID, RestartHeader};

const SLOT_COUNT: usize = 2;

pub(crate) struct RestartArea {
    slots: [PathBuf; SLOT_COUNT],
    /// Slot holding the newest valid restart record, if any.
    current: Option<usize>,
    last_timestamp: u32,
}

impl RestartArea {
    pub(crate) fn open(dir: &Path) -> LogResult<Self> {
        let mut area = Self {
            slots: [dir.join("restart.1"), dir.join("restart.2")],
            current: None,
            last_timestamp: 0,
        };
        if let Some((slot, header, _)) = area.newest()? {
            area.current = Some(slot);
            area.last_timestamp = header.timestamp;
        }
        Ok(area)
    }

    fn read_slot(path: &Path) -> LogResult<Option<(RestartHeader, Vec<u8>)>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LogError::Io(e)),
        };
        let mut raw = [0u8; RESTART_HEADER_SIZE];
        match file.read_exact(&mut raw) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(LogError::Io(e)),
        }
        let header = RestartHeader::from_bytes(&raw);
        if !header.is_valid() {
            return Ok(None);
        }
        let mut data = vec![0u8; header.data_length as usize];
        match file.read_exact(&mut data) {
            Ok(()) => Ok(Some((header, data))),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                warn!(path = ?path, "restart slot marked valid but truncated");
                Ok(None)
            }
            Err(e) => Err(LogError::Io(e)),
        }
    }

    fn newest(&self) -> LogResult<Option<(usize, RestartHeader, Vec<u8>)>> {
        let mut newest: Option<(usize, RestartHeader, Vec<u8>)> = None;
        for (slot, path) in self.slots.iter().enumerate() {
            if let Some((header, data)) = Self::read_slot(path)? {
                let newer = newest
                    .as_ref()
                    .map(|(_, best, _)| header.timestamp > best.timestamp)
                    .unwrap_or(true);
                if newer {
                    newest = Some((slot, header, data));
                }
            }
        }
        Ok(newest)
    }

    pub(crate) fn read(&self) -> LogResult<Option<Vec<u8>>> {
        Ok(self.newest()?.map(|(_, _, data)| data))
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> LogResult<()> {
        let slot = match self.current {
            Some(current) => (current + 1) % SLOT_COUNT,
            None => 0,
        };
        let now = chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
        let timestamp = now.max(self.last_timestamp.wrapping_add(1));

        let mut header = RestartHeader {
            valid: 0,
            data_length: data.len() as u32,
            timestamp,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.slots[slot])?;
        file.write_all(&header.to_bytes())?;
        file.write_all(data)?;
        file.sync_data()?;

        header.valid = RESTART_VALID;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.to_bytes())?;
        file.sync_data()?;

        debug!(slot, timestamp, len = data.len(), "restart record written");
        self.current = Some(slot);
        self.last_timestamp = timestamp;
        Ok(())
    }
}
