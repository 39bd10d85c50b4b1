use std::fs;
use std::path::{Path, PathBuf};

use tpc_log::{Log, LogConfig, Lsn, RecordType, WriteMode};

/// Small extents so a handful of records spans several extent files.
pub const SMALL_EXTENT_SIZE: u64 = 512;

pub struct TestCleaner {
    dir: PathBuf,
}

impl TestCleaner {
    pub fn new(config: &LogConfig) -> Self {
        Self {
            dir: config.base_dir.clone(),
        }
    }
}

impl Drop for TestCleaner {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

pub fn small_config(dir: &Path) -> LogConfig {
    LogConfig {
        extent_size: SMALL_EXTENT_SIZE,
        extent_radix: 16,
        ..LogConfig::with_base_dir(dir)
    }
}

pub fn payload(i: usize) -> Vec<u8> {
    format!("record-{i:03}-{}", "x".repeat(80)).into_bytes()
}

pub fn write_records(log: &Log, count: usize) -> Vec<Lsn> {
    (0..count)
        .map(|i| {
            log.write(&payload(i), RecordType::Normal, WriteMode::Buffered)
                .unwrap()
        })
        .collect()
}
