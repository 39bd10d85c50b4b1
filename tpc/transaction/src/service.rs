//! Transaction service context.
//!
//! The service owns everything that was process-global state: the log pool,
//! the coordinator table, the freeze gate and the recovery manager. Several
//! services can run side by side in one process as long as they use
//! different log directories.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tpc_log::{LogConfig, LogPool, Lsn};
use tracing::{debug, error, info, warn};

use crate::coordinator::Coordinator;
use crate::error::{TransactionError, TransactionResult};
use crate::freeze::FreezeGate;
use crate::journal::Journal;
use crate::participant::{Participant, RecoveryHandle, ResourceRegistry, Synchronization};
use crate::recovery::RecoveryManager;
use crate::status::Status;
use crate::table::TransactionTable;
use crate::terminator::CompletionDriver;
use crate::tid::{GlobalTid, LocalTid};
use crate::xa::XaTerminator;

pub const DEFAULT_LOG_NAME: &str = "coordinator";
pub const DEFAULT_KEYPOINT_INTERVAL: u64 = 64;

#[derive(Debug, Clone)]
pub struct TransactionServiceConfig {
    pub log: LogConfig,
    /// Name of the coordinator log inside `log.base_dir`.
    pub log_name: String,
    /// Completions between two keypoints. Zero disables periodic keypoints.
    pub keypoint_interval: u64,
    /// Deadline applied by [`TransactionService::begin`].
    pub default_timeout: Option<Duration>,
    /// Without a log nothing survives a restart.
    pub recoverable: bool,
}

impl Default for TransactionServiceConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            log_name: DEFAULT_LOG_NAME.to_string(),
            keypoint_interval: DEFAULT_KEYPOINT_INTERVAL,
            default_timeout: None,
            recoverable: true,
        }
    }
}

impl TransactionServiceConfig {
    pub fn with_log_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            log: LogConfig::with_base_dir(base_dir),
            ..Self::default()
        }
    }
}

pub struct TransactionService {
    config: TransactionServiceConfig,
    pool: Option<LogPool>,
    table: Arc<TransactionTable>,
    gate: Arc<FreezeGate>,
    recovery: Arc<RecoveryManager>,
    xa: XaTerminator,
    /// Serializes freeze and unfreeze.
    freeze_lock: Mutex<()>,
    frozen: AtomicBool,
    resync: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl TransactionService {
    pub fn start(config: TransactionServiceConfig) -> TransactionResult<Self> {
        Self::start_with_resources(config, Arc::new(ResourceRegistry::new()))
    }

    /// Opens the coordinator log, recovers unfinished transactions and
    /// starts resynchronizing them in the background. `resources` must
    /// already hold the participants recovered transactions refer to.
    pub fn start_with_resources(
        config: TransactionServiceConfig,
        resources: Arc<ResourceRegistry>,
    ) -> TransactionResult<Self> {
        let (pool, journal) = if config.recoverable {
            let pool = LogPool::new(config.log.clone());
            let log = pool.acquire(&config.log_name)?;
            (Some(pool), Some(Arc::new(Journal::new(log))))
        } else {
            (None, None)
        };
        let table = Arc::new(TransactionTable::new(journal, config.keypoint_interval));
        let gate = Arc::new(FreezeGate::new());
        let recovery = Arc::new(RecoveryManager::new(
            table.clone(),
            resources,
            gate.clone(),
        ));

        let recovered = recovery.recover()?;
        let resync = {
            let recovery = recovery.clone();
            thread::Builder::new()
                .name("tpc-resync".to_string())
                .spawn(move || {
                    if let Err(e) = recovery.resync() {
                        error!(error = %e, "resync failed");
                    }
                })
                .map_err(|source| TransactionError::ThreadSpawn {
                    name: "resync",
                    source,
                })?
        };
        info!(
            log = %config.log_name,
            dir = %config.log.base_dir.display(),
            recoverable = config.recoverable,
            recovered,
            "transaction service started"
        );

        let xa = XaTerminator::new(table.clone(), recovery.clone(), gate.clone());
        Ok(Self {
            config,
            pool,
            table,
            gate,
            recovery,
            xa,
            freeze_lock: Mutex::new(()),
            frozen: AtomicBool::new(false),
            resync: Mutex::new(Some(resync)),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &TransactionServiceConfig {
        &self.config
    }

    fn ensure_running(&self) -> TransactionResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(TransactionError::ServiceShutDown);
        }
        Ok(())
    }

    /// Starts a top-level transaction with the configured default timeout.
    pub fn begin(&self) -> TransactionResult<TransactionHandle> {
        self.begin_at(self.config.default_timeout.and_then(deadline_after))
    }

    pub fn begin_with_timeout(&self, timeout: Duration) -> TransactionResult<TransactionHandle> {
        self.begin_at(deadline_after(timeout))
    }

    fn begin_at(&self, deadline: Option<DateTime<Utc>>) -> TransactionResult<TransactionHandle> {
        self.ensure_running()?;
        let coordinator = self.table.create(GlobalTid::generate(), false, deadline)?;
        Ok(TransactionHandle {
            local_tid: coordinator.local_tid(),
            global_tid: coordinator.global_tid().clone(),
            table: self.table.clone(),
            driver: CompletionDriver::new(
                coordinator.local_tid(),
                self.table.clone(),
                self.gate.clone(),
            ),
        })
    }

    pub fn coordinator(&self, local_tid: LocalTid) -> Option<Arc<Coordinator>> {
        self.table.get(local_tid)
    }

    pub fn table(&self) -> &Arc<TransactionTable> {
        &self.table
    }

    pub fn xa(&self) -> &XaTerminator {
        &self.xa
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn resources(&self) -> &Arc<ResourceRegistry> {
        self.recovery.resources()
    }

    pub fn keypoint(&self) -> TransactionResult<Option<Lsn>> {
        self.table.keypoint()
    }

    /// Blocks new completions and waits for running ones to finish. Freezing
    /// an already frozen service returns at once.
    pub fn freeze(&self) {
        let _lock = self.freeze_lock.lock();
        if self.frozen.load(Ordering::SeqCst) {
            return;
        }
        self.gate.acquire_write();
        self.frozen.store(true, Ordering::SeqCst);
        info!("transaction completion frozen");
    }

    pub fn unfreeze(&self) {
        let _lock = self.freeze_lock.lock();
        if !self.frozen.swap(false, Ordering::SeqCst) {
            return;
        }
        self.gate.release_write();
        info!("transaction completion unfrozen");
    }

    pub fn is_frozen_all(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Transactions past their deadline that are still undecided.
    pub fn expired(&self) -> Vec<LocalTid> {
        let now = Utc::now();
        self.table
            .coordinators()
            .into_iter()
            .filter(|coordinator| coordinator.is_expired(now))
            .map(|coordinator| coordinator.local_tid())
            .collect()
    }

    /// Rolls back `local_tid` on behalf of the timeout authority. Returns
    /// false when another caller already owned completion; that caller then
    /// rolls back.
    pub fn timeout_expired(&self, local_tid: LocalTid) -> TransactionResult<bool> {
        let driver = CompletionDriver::new(local_tid, self.table.clone(), self.gate.clone());
        let aborted = driver.abort()?;
        debug!(%local_tid, aborted, "timeout expired");
        Ok(aborted)
    }

    pub fn replay_completion(&self, handle: &RecoveryHandle) -> TransactionResult<Status> {
        self.recovery.replay_completion(handle)
    }

    pub fn in_doubt(&self) -> Vec<GlobalTid> {
        self.recovery.in_doubt()
    }

    pub fn wait_for_recovery(&self) {
        self.recovery.wait_for_recovery();
    }

    pub fn wait_for_resync(&self) {
        self.recovery.wait_for_resync();
    }

    /// Stops accepting transactions and closes the coordinator log.
    ///
    /// A normal shutdown waits for resync and, when no transaction holds
    /// durable state, checkpoints the log to its head. An immediate shutdown
    /// only flushes what was written.
    pub fn shutdown(&self, immediate: bool) -> TransactionResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let resync = self.resync.lock().take();
        if !immediate {
            if let Some(handle) = resync {
                if handle.join().is_err() {
                    warn!("resync thread panicked");
                }
            }
        }

        let Some(pool) = &self.pool else {
            info!("transaction service shut down");
            return Ok(());
        };
        if let Some(journal) = self.table.journal() {
            let log = journal.log();
            let idle = self
                .table
                .coordinators()
                .iter()
                .all(|coordinator| !coordinator.has_durable_state());
            if !immediate && idle && !log.is_empty() {
                log.checkpoint(Lsn::HEAD)?;
            }
            log.flush()?;
        }
        pool.remove(&self.config.log_name, false)?;
        info!(immediate, in_flight = self.table.len(), "transaction service shut down");
        Ok(())
    }
}

fn deadline_after(timeout: Duration) -> Option<DateTime<Utc>> {
    let delta = TimeDelta::from_std(timeout).ok()?;
    Utc::now().checked_add_signed(delta)
}

/// Application-side view of a top-level transaction.
///
/// Holds the local tid only; the coordinator stays owned by the table and is
/// gone once the transaction completed.
#[derive(Clone)]
pub struct TransactionHandle {
    local_tid: LocalTid,
    global_tid: GlobalTid,
    table: Arc<TransactionTable>,
    driver: CompletionDriver,
}

impl TransactionHandle {
    pub fn local_tid(&self) -> LocalTid {
        self.local_tid
    }

    pub fn global_tid(&self) -> &GlobalTid {
        &self.global_tid
    }

    pub fn driver(&self) -> &CompletionDriver {
        &self.driver
    }

    pub fn coordinator(&self) -> TransactionResult<Arc<Coordinator>> {
        self.table
            .get(self.local_tid)
            .ok_or_else(|| TransactionError::UnknownTransaction(self.global_tid.to_string()))
    }

    /// `None` once the transaction completed and left the table.
    pub fn status(&self) -> Option<Status> {
        self.table
            .get(self.local_tid)
            .map(|coordinator| coordinator.status())
    }

    pub fn register_resource(
        &self,
        participant: Arc<dyn Participant>,
    ) -> TransactionResult<RecoveryHandle> {
        self.coordinator()?.register_resource(participant)
    }

    pub fn register_synchronization(
        &self,
        synchronization: Arc<dyn Synchronization>,
    ) -> TransactionResult<()> {
        self.coordinator()?
            .register_synchronization(synchronization)
    }

    pub fn set_rollback_only(&self, cause: impl Into<String>) -> TransactionResult<()> {
        self.coordinator()?.set_rollback_only(cause);
        Ok(())
    }

    pub fn commit(&self, prompt_return: bool) -> TransactionResult<()> {
        self.driver.commit(prompt_return)
    }

    pub fn rollback(&self) -> TransactionResult<()> {
        self.driver.rollback()
    }
}
