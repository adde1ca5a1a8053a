//! Redo log record format.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pasha_common::{Key, PartitionId, PashaError, Result, TableId, Tid};
use serde::{Deserialize, Serialize};

/// Log sequence number.
///
/// The high 32 bits name the segment file and the low 32 bits the byte
/// offset inside it, so LSNs order the same way records sit on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn new(segment_id: u32, offset: u32) -> Self {
        Self(((segment_id as u64) << 32) | offset as u64)
    }

    pub fn segment_id(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn offset(&self) -> u32 {
        self.0 as u32
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.segment_id(), self.offset())
    }
}

/// Record kinds written to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogRecordType {
    /// Zero fill at the tail of a preallocated segment.
    Invalid = 0,
    /// Redo image of one modified tuple.
    Redo = 1,
}

impl TryFrom<u8> for LogRecordType {
    type Error = PashaError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(LogRecordType::Invalid),
            1 => Ok(LogRecordType::Redo),
            _ => Err(PashaError::WalCorrupted {
                lsn: 0,
                reason: format!("unknown record type {value}"),
            }),
        }
    }
}

/// Set when the writer synced the segment right after this record.
pub const FLAG_PERSISTED: u8 = 0x01;

/// One record in a segment.
///
/// On disk:
/// - header (24 bytes): lsn u64, prev_lsn u64, record_type u8, flags u8,
///   reserved u16, payload_len u32
/// - payload
/// - crc32 of header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    /// LSN of the record written just before this one.
    pub prev_lsn: Lsn,
    pub record_type: LogRecordType,
    pub flags: u8,
    pub payload: Bytes,
}

impl LogRecord {
    pub const HEADER_SIZE: usize = 24;
    pub const CHECKSUM_SIZE: usize = 4;
    pub const MAX_PAYLOAD_SIZE: usize = 1 << 20;

    pub fn redo(payload: Bytes) -> Self {
        Self {
            lsn: Lsn::INVALID,
            prev_lsn: Lsn::INVALID,
            record_type: LogRecordType::Redo,
            flags: 0,
            payload,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.flags & FLAG_PERSISTED != 0
    }

    pub fn size_on_disk(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len() + Self::CHECKSUM_SIZE
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size_on_disk());
        buf.put_u64_le(self.lsn.0);
        buf.put_u64_le(self.prev_lsn.0);
        buf.put_u8(self.record_type as u8);
        buf.put_u8(self.flags);
        buf.put_u16_le(0);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    /// Decodes the record at the front of `data`, returning it and the number
    /// of bytes consumed.
    pub fn deserialize(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < Self::HEADER_SIZE + Self::CHECKSUM_SIZE {
            return Err(PashaError::WalCorrupted {
                lsn: 0,
                reason: format!("record needs at least {} bytes, have {}", Self::HEADER_SIZE + Self::CHECKSUM_SIZE, data.len()),
            });
        }

        let mut header = &data[..Self::HEADER_SIZE];
        let lsn = Lsn(header.get_u64_le());
        let prev_lsn = Lsn(header.get_u64_le());
        let record_type = LogRecordType::try_from(header.get_u8())?;
        let flags = header.get_u8();
        header.advance(2);
        let payload_len = header.get_u32_le() as usize;

        if payload_len > Self::MAX_PAYLOAD_SIZE {
            return Err(PashaError::WalCorrupted {
                lsn: lsn.0,
                reason: format!("payload of {payload_len} bytes exceeds limit"),
            });
        }
        let body_end = Self::HEADER_SIZE + payload_len;
        let total = body_end + Self::CHECKSUM_SIZE;
        if data.len() < total {
            return Err(PashaError::WalCorrupted {
                lsn: lsn.0,
                reason: "truncated record".to_string(),
            });
        }

        let stored = (&data[body_end..total]).get_u32_le();
        let computed = crc32fast::hash(&data[..body_end]);
        if stored != computed {
            return Err(PashaError::WalCorrupted {
                lsn: lsn.0,
                reason: format!("checksum mismatch: stored={stored:#x}, computed={computed:#x}"),
            });
        }

        let record = Self {
            lsn,
            prev_lsn,
            record_type,
            flags,
            payload: Bytes::copy_from_slice(&data[Self::HEADER_SIZE..body_end]),
        };
        Ok((record, total))
    }

    /// Decodes every record in a segment body. Parsing stops at the first
    /// zero-filled header, which marks the unwritten tail.
    pub fn parse_all(data: &[u8]) -> Result<Vec<LogRecord>> {
        let mut records = Vec::new();
        let mut pos = 0;
        while data.len() - pos >= Self::HEADER_SIZE {
            if data[pos..pos + Self::HEADER_SIZE].iter().all(|b| *b == 0) {
                break;
            }
            let (record, used) = Self::deserialize(&data[pos..])?;
            records.push(record);
            pos += used;
        }
        Ok(records)
    }
}

/// Operation captured by a redo payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RedoOp {
    Write = 1,
    Insert = 2,
    Delete = 3,
}

impl TryFrom<u8> for RedoOp {
    type Error = PashaError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RedoOp::Write),
            2 => Ok(RedoOp::Insert),
            3 => Ok(RedoOp::Delete),
            _ => Err(PashaError::WalCorrupted {
                lsn: 0,
                reason: format!("unknown redo op {value}"),
            }),
        }
    }
}

/// New image of one tuple, stamped with the commit timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoPayload {
    pub op: RedoOp,
    pub table: TableId,
    pub partition: PartitionId,
    pub key: Key,
    pub tid: Tid,
    /// Empty for deletes.
    pub value: Bytes,
}

impl RedoPayload {
    const FIXED_SIZE: usize = 1 + 4 + 4 + 8 + 8 + 4;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::FIXED_SIZE + self.value.len());
        buf.put_u8(self.op as u8);
        buf.put_u32_le(self.table.0);
        buf.put_u32_le(self.partition.0);
        buf.put_u64_le(self.key);
        buf.put_u64_le(self.tid);
        buf.put_u32_le(self.value.len() as u32);
        buf.put_slice(&self.value);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < Self::FIXED_SIZE {
            return Err(PashaError::WalCorrupted {
                lsn: 0,
                reason: "redo payload too short".to_string(),
            });
        }
        let op = RedoOp::try_from(data.get_u8())?;
        let table = TableId(data.get_u32_le());
        let partition = PartitionId(data.get_u32_le());
        let key = data.get_u64_le();
        let tid = data.get_u64_le();
        let len = data.get_u32_le() as usize;
        if data.len() != len {
            return Err(PashaError::WalCorrupted {
                lsn: 0,
                reason: format!("redo value length {len} but {} bytes remain", data.len()),
            });
        }
        Ok(Self {
            op,
            table,
            partition,
            key,
            tid,
            value: Bytes::copy_from_slice(data),
        })
    }
}
