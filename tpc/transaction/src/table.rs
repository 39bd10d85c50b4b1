//! Table of live coordinators.
//!
//! Coordinators are owned by the table and addressed by [`LocalTid`]; every
//! other component holds a local tid and looks the coordinator up. A second
//! index maps global tids to local tids.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tpc_log::{Lsn, RecordType, WriteMode};
use tracing::{debug, info};

use crate::coordinator::Coordinator;
use crate::error::TransactionResult;
use crate::journal::Journal;
use crate::status::Outcome;
use crate::tid::{GlobalTid, LocalTid, LocalTidGenerator};

pub struct TransactionTable {
    coordinators: DashMap<LocalTid, Arc<Coordinator>>,
    by_global: DashMap<GlobalTid, LocalTid>,
    tids: LocalTidGenerator,
    journal: Option<Arc<Journal>>,
    keypoint_interval: u64,
    completions: AtomicU64,
    keypoint_lock: Mutex<()>,
}

impl TransactionTable {
    pub fn new(journal: Option<Arc<Journal>>, keypoint_interval: u64) -> Self {
        Self {
            coordinators: DashMap::new(),
            by_global: DashMap::new(),
            tids: LocalTidGenerator::new(),
            journal,
            keypoint_interval,
            completions: AtomicU64::new(0),
            keypoint_lock: Mutex::new(()),
        }
    }

    pub fn journal(&self) -> Option<&Arc<Journal>> {
        self.journal.as_ref()
    }

    fn insert(&self, coordinator: Coordinator) -> Arc<Coordinator> {
        let coordinator = Arc::new(coordinator);
        self.by_global
            .insert(coordinator.global_tid().clone(), coordinator.local_tid());
        self.coordinators
            .insert(coordinator.local_tid(), coordinator.clone());
        coordinator
    }

    pub fn create(
        &self,
        global_tid: GlobalTid,
        subordinate: bool,
        deadline: Option<DateTime<Utc>>,
    ) -> TransactionResult<Arc<Coordinator>> {
        let local_tid = self.tids.next()?;
        Ok(self.insert(Coordinator::new(
            local_tid,
            global_tid,
            subordinate,
            deadline,
            self.journal.clone(),
        )))
    }

    pub(crate) fn insert_recovered(
        &self,
        global_tid: GlobalTid,
        decision: Option<Outcome>,
        participants: Vec<String>,
    ) -> TransactionResult<Arc<Coordinator>> {
        let local_tid = self.tids.next()?;
        Ok(self.insert(Coordinator::recovered(
            local_tid,
            global_tid,
            decision,
            participants,
            self.journal.clone(),
        )))
    }

    pub fn get(&self, local_tid: LocalTid) -> Option<Arc<Coordinator>> {
        self.coordinators
            .get(&local_tid)
            .map(|entry| entry.value().clone())
    }

    pub fn local_tid_of(&self, global_tid: &GlobalTid) -> Option<LocalTid> {
        self.by_global.get(global_tid).map(|entry| *entry.value())
    }

    pub fn find(&self, global_tid: &GlobalTid) -> Option<Arc<Coordinator>> {
        self.local_tid_of(global_tid)
            .and_then(|local_tid| self.get(local_tid))
    }

    pub fn contains(&self, global_tid: &GlobalTid) -> bool {
        self.by_global.contains_key(global_tid)
    }

    pub fn len(&self) -> usize {
        self.coordinators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.is_empty()
    }

    pub fn coordinators(&self) -> Vec<Arc<Coordinator>> {
        let mut coordinators: Vec<_> = self
            .coordinators
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        coordinators.sort_by_key(|coordinator| coordinator.local_tid());
        coordinators
    }

    /// Drops a completed coordinator from the table. Every
    /// `keypoint_interval` completions the journal is compacted.
    pub fn finish(&self, local_tid: LocalTid) -> TransactionResult<()> {
        let Some((_, coordinator)) = self.coordinators.remove(&local_tid) else {
            return Ok(());
        };
        self.by_global
            .remove_if(coordinator.global_tid(), |_, tid| *tid == local_tid);
        debug!(global_tid = %coordinator.global_tid(), %local_tid, "coordinator removed");

        let completed = self.completions.fetch_add(1, Ordering::SeqCst) + 1;
        if self.keypoint_interval > 0 && completed % self.keypoint_interval == 0 {
            self.keypoint()?;
        }
        Ok(())
    }

    /// Compacts the journal.
    ///
    /// Writes a keypoint start marker, rewrites the durable state of every
    /// live coordinator, forces a keypoint end marker and truncates the log to
    /// the start marker. Returns the LSN of the start marker.
    pub fn keypoint(&self) -> TransactionResult<Option<Lsn>> {
        let Some(journal) = &self.journal else {
            return Ok(None);
        };
        let _guard = self.keypoint_lock.lock();

        let start = journal.write_marker(RecordType::KeypointStart, WriteMode::Buffered)?;
        let mut rewritten = 0usize;
        for coordinator in self.coordinators() {
            if coordinator.rewrite(journal)? {
                rewritten += 1;
            }
        }
        journal.write_marker(RecordType::KeypointEnd, WriteMode::Forced)?;
        journal.log().truncate(start)?;
        info!(%start, rewritten, "keypoint completed");
        Ok(Some(start))
    }
}
