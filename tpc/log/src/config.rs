use std::env;
use std::path::PathBuf;

use crate::error::{LogError, LogResult};

const DEFAULT_LOG_DIR_NAME: &str = ".tpc-log";
pub const DEFAULT_EXTENT_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_EXTENT_RADIX: u32 = 1000;
const DEFAULT_POOL_CAPACITY: usize = 16;

/// Configuration shared by every log opened through a [`crate::LogPool`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding one sub-directory per log name
    pub base_dir: PathBuf,

    /// Size in bytes of a single extent file
    pub extent_size: u64,

    /// Number of physical extent files a log may cycle through
    pub extent_radix: u32,

    /// Maximum number of log handles kept open by the pool
    pub pool_capacity: usize,
}

fn default_log_dir() -> PathBuf {
    env::current_dir()
        .map(|dir| dir.join(DEFAULT_LOG_DIR_NAME))
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR_NAME))
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            base_dir: default_log_dir(),
            extent_size: DEFAULT_EXTENT_SIZE,
            extent_radix: DEFAULT_EXTENT_RADIX,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl LogConfig {
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Checks that LSN offsets can address every byte of an extent.
    pub fn validate(&self) -> LogResult<()> {
        if self.extent_size == 0 || self.extent_size > u64::from(u32::MAX) {
            return Err(LogError::InvalidConfig(format!(
                "extent size {} must be between 1 and {} bytes",
                self.extent_size,
                u32::MAX
            )));
        }
        Ok(())
    }
}
