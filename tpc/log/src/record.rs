// record.rs
// Fixed-layout framing of log records and restart records.
//
// Log record layout (little-endian):
// ┌──────────┬──────────────┬──────────────┬──────────────┬────────────┬──────────┬──────────────┐
// │ u32 type │ current LSN  │ previous LSN │ next LSN     │ u32 length │ payload… │ current LSN  │
// │          │ (16 bytes)   │ (16 bytes)   │ (16 bytes)   │            │          │ (16 bytes)   │
// └──────────┴──────────────┴──────────────┴──────────────┴────────────┴──────────┴──────────────┘
// The trailing LSN is the record ending. It must equal the header's current
// LSN; a mismatch means the record was torn or overwritten.
//
// Restart record layout:
// ┌───────────┬─────────────────┬───────────────┬──────────┐
// │ u32 valid │ u32 data length │ u32 timestamp │ payload… │
// └───────────┴─────────────────┴───────────────┴──────────┘

use crate::error::{LogError, LogResult};
use crate::lsn::{LSN_SLOT_SIZE, Lsn};

pub const HEADER_SIZE: usize = 4 + 3 * LSN_SLOT_SIZE + 4;
pub const ENDING_SIZE: usize = LSN_SLOT_SIZE;
/// Bytes a record occupies on top of its payload.
pub const RECORD_OVERHEAD: usize = HEADER_SIZE + ENDING_SIZE;
/// A link record carries no payload.
pub const LINK_RECORD_SIZE: usize = RECORD_OVERHEAD;

pub const RESTART_HEADER_SIZE: usize = 12;
/// Marker stored in the `valid` field of a completely written restart record.
pub const RESTART_VALID: u32 = 0x5253_5452;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    Normal = 1,
    KeypointStart = 2,
    KeypointEnd = 3,
    Rewrite = 4,
    /// Continues the record chain in the next extent. Never surfaced to readers.
    Link = 5,
}

impl TryFrom<u32> for RecordType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RecordType::Normal),
            2 => Ok(RecordType::KeypointStart),
            3 => Ok(RecordType::KeypointEnd),
            4 => Ok(RecordType::Rewrite),
            5 => Ok(RecordType::Link),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_type: RecordType,
    pub current: Lsn,
    pub previous: Lsn,
    pub next: Lsn,
    pub length: u32,
}

impl RecordHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.record_type as u32).to_le_bytes());
        buf.extend_from_slice(&self.current.to_bytes());
        buf.extend_from_slice(&self.previous.to_bytes());
        buf.extend_from_slice(&self.next.to_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
    }

    /// Decodes a header read from position `at`.
    ///
    /// The header must name `at` as its own LSN.
    pub fn decode(bytes: &[u8; HEADER_SIZE], at: Lsn) -> LogResult<Self> {
        let raw_type = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let record_type = RecordType::try_from(raw_type)
            .map_err(|t| LogError::corrupt(at, format!("unknown record type {t}")))?;

        let slot = |index: usize| -> LogResult<Lsn> {
            let start = 4 + index * LSN_SLOT_SIZE;
            let mut raw = [0u8; LSN_SLOT_SIZE];
            raw.copy_from_slice(&bytes[start..start + LSN_SLOT_SIZE]);
            Lsn::from_bytes(&raw)
                .ok_or_else(|| LogError::corrupt(at, "non-zero reserved bytes in LSN slot"))
        };
        let current = slot(0)?;
        let previous = slot(1)?;
        let next = slot(2)?;

        let len_at = 4 + 3 * LSN_SLOT_SIZE;
        let length = u32::from_le_bytes([
            bytes[len_at],
            bytes[len_at + 1],
            bytes[len_at + 2],
            bytes[len_at + 3],
        ]);

        if current != at {
            return Err(LogError::corrupt(
                at,
                format!("header names LSN {current} but was read from {at}"),
            ));
        }

        Ok(Self {
            record_type,
            current,
            previous,
            next,
            length,
        })
    }

    /// Total on-disk size of the record this header describes.
    pub fn record_size(&self) -> usize {
        RECORD_OVERHEAD + self.length as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordEnding {
    pub current: Lsn,
}

impl RecordEnding {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.current.to_bytes());
    }

    pub fn decode(bytes: &[u8; ENDING_SIZE], at: Lsn) -> LogResult<Self> {
        let current = Lsn::from_bytes(bytes)
            .ok_or_else(|| LogError::corrupt(at, "non-zero reserved bytes in record ending"))?;
        Ok(Self { current })
    }
}

/// Appends a complete record (header, payload and ending) to `buf`.
pub fn encode_record(buf: &mut Vec<u8>, header: &RecordHeader, payload: &[u8]) {
    debug_assert_eq!(header.length as usize, payload.len());
    header.encode(buf);
    buf.extend_from_slice(payload);
    RecordEnding {
        current: header.current,
    }
    .encode(buf);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartHeader {
    pub valid: u32,
    pub data_length: u32,
    pub timestamp: u32,
}

impl RestartHeader {
    pub fn is_valid(&self) -> bool {
        self.valid == RESTART_VALID
    }

    pub fn to_bytes(&self) -> [u8; RESTART_HEADER_SIZE] {
        let mut buf = [0u8; RESTART_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.valid.to_le_bytes());
        buf[4..8].copy_from_slice(&self.data_length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; RESTART_HEADER_SIZE]) -> Self {
        Self {
            valid: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            data_length: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            timestamp: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }
}
