use std::sync::Arc;

use tpc_log::{Log, LogRecord, Lsn, RecordType, WriteMode};
use tracing::trace;

use crate::error::TransactionResult;
use crate::record::CoordinatorRecord;

/// Coordinator view of a log: typed records in, typed records out.
pub struct Journal {
    log: Arc<Log>,
}

impl Journal {
    pub fn new(log: Arc<Log>) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    pub fn write(
        &self,
        record: &CoordinatorRecord,
        record_type: RecordType,
        mode: WriteMode,
    ) -> TransactionResult<Lsn> {
        let bytes = record.to_bytes()?;
        let lsn = self.log.write(&bytes, record_type, mode)?;
        trace!(global_tid = %record.global_tid(), %lsn, ?record_type, "coordinator record written");
        Ok(lsn)
    }

    pub fn write_marker(&self, record_type: RecordType, mode: WriteMode) -> TransactionResult<Lsn> {
        Ok(self.log.write(&[], record_type, mode)?)
    }

    /// Decodes the records a restart has to replay, in log order.
    pub fn replay(&self) -> TransactionResult<Vec<CoordinatorRecord>> {
        self.log
            .recovery_records()?
            .iter()
            .map(|entry| Ok(CoordinatorRecord::from_bytes(&entry.data)?))
            .collect()
    }
}
