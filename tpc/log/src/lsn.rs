//! Log sequence numbers.
//!
//! An LSN addresses a record inside the log as an (extent, offset) pair. The
//! ordering is lexicographic on the extent first, then the byte offset inside
//! the extent, so records appended later always compare greater.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Size of an encoded LSN slot in the record framing.
pub const LSN_SLOT_SIZE: usize = 16;

/// Address of a record inside the log.
///
/// Field order matters: the derived ordering compares `extent` before `offset`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn {
    extent: u32,
    offset: u32,
}

impl Lsn {
    /// The null LSN, used as the "previous" link of the very first record.
    pub const NULL: Lsn = Lsn::new(0, 0);
    /// The first address a fresh log writes to.
    pub const FIRST: Lsn = Lsn::new(1, 0);
    /// Sentinel resolving to the oldest record still needed.
    pub const TAIL: Lsn = Lsn::new(0xFFFF_FFFE, 0xFFFF_FFFE);
    /// Sentinel resolving to the most recently written record.
    pub const HEAD: Lsn = Lsn::new(0xFFFF_FFFF, 0xFFFF_FFFF);

    pub const fn new(extent: u32, offset: u32) -> Self {
        Self { extent, offset }
    }

    pub fn extent(&self) -> u32 {
        self.extent
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Returns true for the `HEAD` and `TAIL` sentinels.
    pub fn is_sentinel(&self) -> bool {
        *self == Self::HEAD || *self == Self::TAIL
    }

    pub fn less_than(&self, other: &Lsn) -> bool {
        self < other
    }

    /// The LSN `len` bytes further along the same extent.
    pub(crate) fn advance(&self, len: usize) -> Lsn {
        Lsn::new(self.extent, self.offset + len as u32)
    }

    /// The first address of the following extent.
    pub(crate) fn next_extent(&self) -> Lsn {
        Lsn::new(self.extent.wrapping_add(1), 0)
    }

    /// Encodes the LSN into its 16 byte slot: offset, extent, then 8 reserved
    /// zero bytes.
    pub fn to_bytes(&self) -> [u8; LSN_SLOT_SIZE] {
        let mut buf = [0u8; LSN_SLOT_SIZE];
        buf[0..4].copy_from_slice(&self.offset.to_le_bytes());
        buf[4..8].copy_from_slice(&self.extent.to_le_bytes());
        buf
    }

    /// Decodes an LSN slot. Returns `None` when the reserved area is not zero.
    pub fn from_bytes(buf: &[u8; LSN_SLOT_SIZE]) -> Option<Lsn> {
        if buf[8..].iter().any(|b| *b != 0) {
            return None;
        }
        let offset = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let extent = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Some(Lsn::new(extent, offset))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Lsn::HEAD => write!(f, "HEAD"),
            Lsn::TAIL => write!(f, "TAIL"),
            Lsn::NULL => write!(f, "NULL"),
            Lsn { extent, offset } => write!(f, "{extent}.{offset}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_extent_major() {
        let a = Lsn::new(1, 4000);
        let b = Lsn::new(2, 0);
        let c = Lsn::new(2, 72);
        assert!(a.less_than(&b));
        assert!(b.less_than(&c));
        assert!(!c.less_than(&a));
        assert!(Lsn::TAIL.less_than(&Lsn::HEAD));
        assert!(Lsn::NULL.less_than(&Lsn::FIRST));
    }

    #[test]
    fn test_slot_layout() {
        let lsn = Lsn::new(7, 0x0102_0304);
        let bytes = lsn.to_bytes();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &[7, 0, 0, 0]);
        assert_eq!(Lsn::from_bytes(&bytes), Some(lsn));
    }

    #[test]
    fn test_nonzero_reserved_area_is_rejected() {
        let mut bytes = Lsn::new(3, 10).to_bytes();
        bytes[12] = 0xAA;
        assert_eq!(Lsn::from_bytes(&bytes), None);
    }

    #[test]
    fn test_display_sentinels() {
        assert_eq!(Lsn::HEAD.to_string(), "HEAD");
        assert_eq!(Lsn::TAIL.to_string(), "TAIL");
        assert_eq!(Lsn::NULL.to_string(), "NULL");
        assert_eq!(Lsn::new(4, 128).to_string(), "4.128");
    }
}
