//! Transaction identifiers.
//!
//! A [`GlobalTid`] names a transaction everywhere and survives a crash. A
//! [`LocalTid`] is a process-local handle into the coordinator table and is
//! reassigned when a transaction is recovered.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{TransactionError, TransactionResult, XaError, XaResult};

/// Format identifier stamped on transactions created by this service.
pub const NATIVE_FORMAT_ID: i32 = 0x5450_4321;

/// Maximum length of the global and branch parts of an [`Xid`].
pub const MAX_XID_PART_LEN: usize = 64;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LocalTid(u64);

impl LocalTid {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LocalTid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out local transaction ids, starting from 1.
pub struct LocalTidGenerator {
    counter: AtomicU64,
}

impl LocalTidGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> TransactionResult<LocalTid> {
        let mut cur = self.counter.load(Ordering::SeqCst);
        loop {
            if cur == u64::MAX {
                return Err(TransactionError::TidOverflow(cur));
            }
            match self.counter.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(LocalTid(cur)),
                Err(actual) => cur = actual,
            }
        }
    }
}

impl Default for LocalTidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Globally unique, durable transaction identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalTid {
    format_id: i32,
    gtrid: Vec<u8>,
    bqual: Vec<u8>,
}

impl GlobalTid {
    /// Creates a fresh identifier for a transaction started here.
    pub fn generate() -> Self {
        Self {
            format_id: NATIVE_FORMAT_ID,
            gtrid: Uuid::new_v4().as_bytes().to_vec(),
            bqual: Vec::new(),
        }
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn gtrid(&self) -> &[u8] {
        &self.gtrid
    }

    pub fn bqual(&self) -> &[u8] {
        &self.bqual
    }

    pub fn to_xid(&self) -> Xid {
        Xid {
            format_id: self.format_id,
            gtrid: self.gtrid.clone(),
            bqual: self.bqual.clone(),
        }
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    bytes.iter().try_for_each(|b| write!(f, "{b:02x}"))
}

impl fmt::Display for GlobalTid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:", self.format_id)?;
        write_hex(f, &self.gtrid)?;
        if !self.bqual.is_empty() {
            write!(f, ":")?;
            write_hex(f, &self.bqual)?;
        }
        Ok(())
    }
}

impl fmt::Debug for GlobalTid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalTid({self})")
    }
}

/// X/Open transaction branch identifier used by inbound transactions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    pub format_id: i32,
    pub gtrid: Vec<u8>,
    pub bqual: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, gtrid: impl Into<Vec<u8>>, bqual: impl Into<Vec<u8>>) -> Self {
        Self {
            format_id,
            gtrid: gtrid.into(),
            bqual: bqual.into(),
        }
    }

    /// Rejects the null xid (format id 0) and malformed parts.
    pub fn validate(&self) -> XaResult<()> {
        if self.format_id == 0 || self.gtrid.is_empty() {
            return Err(XaError::NoTransaction(format!("invalid xid {self:?}")));
        }
        if self.gtrid.len() > MAX_XID_PART_LEN || self.bqual.len() > MAX_XID_PART_LEN {
            return Err(XaError::InvalidArguments(format!(
                "xid parts must not exceed {MAX_XID_PART_LEN} bytes"
            )));
        }
        Ok(())
    }
}

impl From<&Xid> for GlobalTid {
    fn from(xid: &Xid) -> Self {
        Self {
            format_id: xid.format_id,
            gtrid: xid.gtrid.clone(),
            bqual: xid.bqual.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_tid_generator() {
        let generator = LocalTidGenerator::new();
        let first = generator.next().unwrap();
        let second = generator.next().unwrap();
        assert_eq!(first.raw(), 1);
        assert_eq!(second.raw(), 2);
    }

    #[test]
    fn test_local_tid_overflow() {
        let generator = LocalTidGenerator {
            counter: AtomicU64::new(u64::MAX - 1),
        };
        assert_eq!(generator.next().unwrap().raw(), u64::MAX - 1);
        assert!(matches!(
            generator.next(),
            Err(TransactionError::TidOverflow(u64::MAX))
        ));
    }

    #[test]
    fn test_generated_global_tids_are_unique() {
        let a = GlobalTid::generate();
        let b = GlobalTid::generate();
        assert_ne!(a, b);
        assert_eq!(a.format_id(), NATIVE_FORMAT_ID);
        assert_eq!(a.gtrid().len(), 16);
    }

    #[test]
    fn test_xid_round_trips_through_global_tid() {
        let xid = Xid::new(7, b"global".to_vec(), b"branch".to_vec());
        let gtid = GlobalTid::from(&xid);
        assert_eq!(gtid.to_xid(), xid);
        assert_eq!(gtid.to_string(), "7:676c6f62616c:6272616e6368");
    }

    #[test]
    fn test_xid_validation() {
        assert!(Xid::new(1, b"g".to_vec(), Vec::new()).validate().is_ok());
        assert!(matches!(
            Xid::new(0, b"g".to_vec(), Vec::new()).validate(),
            Err(XaError::NoTransaction(_))
        ));
        assert!(matches!(
            Xid::new(1, vec![1u8; 65], Vec::new()).validate(),
            Err(XaError::InvalidArguments(_))
        ));
    }
}
