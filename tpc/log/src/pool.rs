use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::LogConfig;
use crate::error::LogResult;
use crate::log::Log;

const MIN_POOL_CAPACITY: NonZeroUsize = NonZeroUsize::MIN;

struct PoolState {
    cache: LruCache<String, Arc<Log>>,
    /// Every instance handed out and not dropped yet, cached or not.
    live: HashMap<String, Weak<Log>>,
}

impl PoolState {
    fn usable(log: &Arc<Log>) -> bool {
        !log.is_closed() && !log.is_failed()
    }

    /// Caches `log` under `name`, flushing whatever the cache evicts.
    fn cache(&mut self, name: &str, log: Arc<Log>) {
        if let Some((evicted, old)) = self.cache.push(name.to_string(), log) {
            if evicted != name {
                debug!(log = %evicted, "log evicted from pool");
                if PoolState::usable(&old) {
                    if let Err(e) = old.flush() {
                        warn!(log = %evicted, error = %e, "failed to flush evicted log");
                    }
                }
            }
        }
    }
}

/// Keeps recently used log instances open.
///
/// One name maps to at most one usable instance: acquiring a name returns
/// the instance already in use, even after the cache evicted it, so a log
/// directory never has two writers. When the cache is full the least
/// recently used instance is flushed and dropped from the cache; it stays
/// open for as long as someone holds it.
pub struct LogPool {
    config: LogConfig,
    state: Mutex<PoolState>,
}

impl LogPool {
    pub fn new(config: LogConfig) -> Self {
        let capacity = NonZeroUsize::new(config.pool_capacity).unwrap_or(MIN_POOL_CAPACITY);
        Self {
            config,
            state: Mutex::new(PoolState {
                cache: LruCache::new(capacity),
                live: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Returns the instance for `name`, opening the log when no usable
    /// instance exists. A closed or failed instance is replaced by a fresh
    /// open, which recovers whatever reached disk.
    pub fn acquire(&self, name: &str) -> LogResult<Arc<Log>> {
        let mut state = self.state.lock();
        if let Some(log) = state.cache.get(name) {
            if PoolState::usable(log) {
                return Ok(log.clone());
            }
            state.cache.pop(name);
        }

        state.live.retain(|_, log| log.strong_count() > 0);
        if let Some(log) = state.live.get(name).and_then(Weak::upgrade) {
            if PoolState::usable(&log) {
                debug!(log = name, "evicted log still in use, cached again");
                state.cache(name, log.clone());
                return Ok(log);
            }
        }

        let log = Arc::new(Log::open(&self.config, name)?);
        state.live.insert(name.to_string(), Arc::downgrade(&log));
        state.cache(name, log.clone());
        Ok(log)
    }

    /// Returns a log to the pool after resetting its per-use state.
    pub fn release(&self, log: &Arc<Log>) -> LogResult<()> {
        log.reset()
    }

    /// Drops `name` from the pool and closes it, including an instance that
    /// was evicted but is still held.
    pub fn remove(&self, name: &str, delete_files: bool) -> LogResult<()> {
        let removed = {
            let mut state = self.state.lock();
            let cached = state.cache.pop(name);
            let live = state.live.remove(name).and_then(|log| log.upgrade());
            cached.or(live)
        };
        match removed {
            Some(log) => log.close(delete_files),
            None if delete_files => {
                let log = Log::open(&self.config, name)?;
                log.close(true)
            }
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().cache.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().cache.contains(name)
    }

    /// Closes every log the pool handed out.
    pub fn clear(&self) -> LogResult<()> {
        let mut state = self.state.lock();
        while let Some((_, log)) = state.cache.pop_lru() {
            log.close(false)?;
        }
        for (_, log) in state.live.drain() {
            if let Some(log) = log.upgrade() {
                log.close(false)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordType;
    use crate::{Lsn, WriteMode};

    fn pool(capacity: usize) -> (tempfile::TempDir, LogPool) {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            pool_capacity: capacity,
            ..LogConfig::with_base_dir(dir.path())
        };
        (dir, LogPool::new(config))
    }

    #[test]
    fn test_acquire_returns_cached_instance() {
        let (_dir, pool) = pool(4);
        let first = pool.acquire("coordinator").unwrap();
        let second = pool.acquire("coordinator").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_eviction_keeps_data() {
        let (_dir, pool) = pool(1);
        let log = pool.acquire("a").unwrap();
        let lsn = log.write(b"kept", RecordType::Normal, WriteMode::Buffered).unwrap();
        drop(log);

        pool.acquire("b").unwrap();
        assert!(!pool.contains("a"));

        let reopened = pool.acquire("a").unwrap();
        assert_eq!(reopened.head(), lsn);
    }

    #[test]
    fn test_evicted_log_in_use_is_not_opened_twice() {
        let (dir, pool) = pool(1);
        let held = pool.acquire("a").unwrap();
        held.write(b"first", RecordType::Normal, WriteMode::Forced).unwrap();

        pool.acquire("b").unwrap();
        assert!(!pool.contains("a"));

        let again = pool.acquire("a").unwrap();
        assert!(Arc::ptr_eq(&held, &again));
        let one = held
            .write(b"from-held", RecordType::Normal, WriteMode::Forced)
            .unwrap();
        let two = again
            .write(b"from-again", RecordType::Normal, WriteMode::Forced)
            .unwrap();
        assert!(one < two);
        drop((held, again));
        pool.clear().unwrap();

        let config = LogConfig::with_base_dir(dir.path());
        let reopened = Log::open(&config, "a").unwrap();
        let data: Vec<Vec<u8>> = reopened
            .entries(Lsn::TAIL, Lsn::HEAD)
            .unwrap()
            .map(|entry| entry.unwrap().data)
            .collect();
        assert_eq!(
            data,
            vec![b"first".to_vec(), b"from-held".to_vec(), b"from-again".to_vec()]
        );
    }

    #[test]
    fn test_closed_log_is_replaced() {
        let (_dir, pool) = pool(2);
        let log = pool.acquire("a").unwrap();
        log.close(false).unwrap();
        let fresh = pool.acquire("a").unwrap();
        assert!(!Arc::ptr_eq(&log, &fresh));
        assert!(!fresh.is_closed());
    }

    #[test]
    fn test_remove_with_delete() {
        let (dir, pool) = pool(2);
        let log = pool.acquire("gone").unwrap();
        log.write(b"x", RecordType::Normal, WriteMode::Forced).unwrap();
        drop(log);
        pool.remove("gone", true).unwrap();
        assert!(!dir.path().join("gone").exists());
        assert!(pool.is_empty());

        let fresh = pool.acquire("gone").unwrap();
        assert_eq!(fresh.head(), Lsn::NULL);
    }
}
