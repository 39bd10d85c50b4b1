//! Control descriptor of a log instance.
//!
//! The descriptor records where the live portion of the log starts (`tail`),
//! the most recently written record (`head`) and the address the next record
//! will be written to (`next`). It is persisted in a small `control` file next
//! to the extents using the `[u32 len][u32 crc32][payload]` framing.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::error::{LogError, LogResult};
use crate::lsn::Lsn;

const CONTROL_FILE_NAME: &str = "control";
const CONTROL_TMP_FILE_NAME: &str = "control.tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlDescriptor {
    pub head: Lsn,
    pub tail: Lsn,
    pub next: Lsn,
}

impl Default for ControlDescriptor {
    fn default() -> Self {
        Self {
            head: Lsn::NULL,
            tail: Lsn::FIRST,
            next: Lsn::FIRST,
        }
    }
}

impl ControlDescriptor {
    /// True when no record between `tail` and `head` is still needed.
    pub fn is_empty(&self) -> bool {
        self.head.is_null() || self.head < self.tail
    }

    /// Resolves the `HEAD`/`TAIL` sentinels against this descriptor.
    pub fn resolve(&self, lsn: Lsn) -> Lsn {
        match lsn {
            Lsn::HEAD => self.head,
            Lsn::TAIL => self.tail,
            other => other,
        }
    }
}

pub(crate) struct ControlFile {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl ControlFile {
    pub(crate) fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(CONTROL_FILE_NAME),
            tmp_path: dir.join(CONTROL_TMP_FILE_NAME),
        }
    }

    pub(crate) fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Writes the descriptor to a temporary file, syncs it and renames it over
    /// the previous control file.
    pub(crate) fn store(&self, descriptor: &ControlDescriptor) -> LogResult<()> {
        let payload = postcard::to_allocvec(descriptor)
            .map_err(|e| LogError::SerializationFailed(e.to_string()))?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let checksum = hasher.finalize();

        let mut data = Vec::with_capacity(8 + payload.len());
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&checksum.to_le_bytes());
        data.extend_from_slice(&payload);

        let mut file = File::create(&self.tmp_path)?;
        file.write_all(&data)?;
        file.sync_data()?;
        drop(file);
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }

    pub(crate) fn load(&self) -> LogResult<ControlDescriptor> {
        let mut file = File::open(&self.path)?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let checksum = u32::from_le_bytes(checksum_bytes);

        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != checksum {
            return Err(LogError::ChecksumMismatch);
        }

        postcard::from_bytes(&payload).map_err(|e| LogError::DeserializationFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom};

    use super::*;

    #[test]
    fn test_fresh_descriptor_is_empty() {
        let descriptor = ControlDescriptor::default();
        assert!(descriptor.is_empty());
        assert_eq!(descriptor.resolve(Lsn::TAIL), Lsn::FIRST);
        assert_eq!(descriptor.resolve(Lsn::HEAD), Lsn::NULL);
    }

    #[test]
    fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let control = ControlFile::new(dir.path());
        assert!(!control.exists());

        let descriptor = ControlDescriptor {
            head: Lsn::new(3, 512),
            tail: Lsn::new(2, 0),
            next: Lsn::new(3, 600),
        };
        control.store(&descriptor).unwrap();
        assert!(control.exists());
        assert_eq!(control.load().unwrap(), descriptor);
    }

    #[test]
    fn test_flipped_byte_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let control = ControlFile::new(dir.path());
        control.store(&ControlDescriptor::default()).unwrap();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.path().join(CONTROL_FILE_NAME))
            .unwrap();
        file.seek(SeekFrom::Start(8)).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(8)).unwrap();
        file.write_all(&[byte[0] ^ 0xFF]).unwrap();
        drop(file);

        assert!(matches!(control.load(), Err(LogError::ChecksumMismatch)));
    }
}
