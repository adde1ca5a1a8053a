//! Log segment files.

use crate::record::{LogRecord, Lsn};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use pasha_common::{PashaError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Identifier of a segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(pub u32);

impl SegmentId {
    pub const FIRST: SegmentId = SegmentId(1);

    pub fn next(&self) -> Self {
        SegmentId(self.0 + 1)
    }

    pub fn filename(&self) -> String {
        format!("{:016}.redo", self.0)
    }

    /// Parses a segment id out of a file name produced by `filename`.
    pub fn from_path(path: &Path) -> Option<SegmentId> {
        if path.extension()? != "redo" {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok().map(SegmentId)
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "seg{:08}", self.0)
    }
}

/// Fixed header at offset zero of every segment.
///
/// Layout (24 bytes): magic "PRDO", version u32, segment_id u32,
/// capacity u32, created_by_host u32, crc32 of the preceding 20 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub segment_id: SegmentId,
    pub capacity: u32,
    pub host: u32,
}

impl SegmentHeader {
    pub const MAGIC: [u8; 4] = *b"PRDO";
    pub const VERSION: u32 = 1;
    pub const SIZE: usize = 24;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_slice(&Self::MAGIC);
        buf.put_u32_le(Self::VERSION);
        buf.put_u32_le(self.segment_id.0);
        buf.put_u32_le(self.capacity);
        buf.put_u32_le(self.host);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let corrupted = |reason: String| PashaError::WalCorrupted { lsn: 0, reason };
        if data.len() < Self::SIZE {
            return Err(corrupted("segment shorter than its header".to_string()));
        }
        if data[..4] != Self::MAGIC {
            return Err(corrupted("bad segment magic".to_string()));
        }
        let stored = (&data[20..24]).get_u32_le();
        if stored != crc32fast::hash(&data[..20]) {
            return Err(corrupted("segment header checksum mismatch".to_string()));
        }
        let mut rest = &data[4..20];
        let version = rest.get_u32_le();
        if version != Self::VERSION {
            return Err(corrupted(format!("unsupported segment version {version}")));
        }
        Ok(Self {
            segment_id: SegmentId(rest.get_u32_le()),
            capacity: rest.get_u32_le(),
            host: rest.get_u32_le(),
        })
    }
}

/// Append handle on the newest segment.
pub struct LogSegment {
    path: PathBuf,
    header: SegmentHeader,
    write_offset: u32,
    file: File,
}

impl LogSegment {
    pub const DEFAULT_CAPACITY: u32 = 16 * 1024 * 1024;

    pub fn create(dir: &Path, segment_id: SegmentId, capacity: u32, host: u32) -> Result<Self> {
        let path = dir.join(segment_id.filename());
        let header = SegmentHeader {
            segment_id,
            capacity,
            host,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&header.encode())?;
        file.sync_all()?;

        Ok(Self {
            path,
            header,
            write_offset: SegmentHeader::SIZE as u32,
            file,
        })
    }

    /// Reopens a segment for appending after the last intact record.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let header = SegmentHeader::decode(&data)?;

        let body = &data[SegmentHeader::SIZE..];
        let mut used = 0usize;
        // A torn final record is dropped; appends resume before it.
        while body.len() - used >= LogRecord::HEADER_SIZE {
            match LogRecord::deserialize(&body[used..]) {
                Ok((_, n)) => used += n,
                Err(_) => break,
            }
        }
        let write_offset = (SegmentHeader::SIZE + used) as u32;
        file.set_len(write_offset as u64)?;
        file.seek(SeekFrom::Start(write_offset as u64))?;

        Ok(Self {
            path: path.to_path_buf(),
            header,
            write_offset,
            file,
        })
    }

    pub fn segment_id(&self) -> SegmentId {
        self.header.segment_id
    }

    pub fn write_offset(&self) -> u32 {
        self.write_offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_space(&self, bytes: usize) -> bool {
        self.header.capacity.saturating_sub(self.write_offset) as usize >= bytes
    }

    /// Writes a record whose LSN was already assigned at the current offset.
    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        let expected = Lsn::new(self.header.segment_id.0, self.write_offset);
        if record.lsn != expected {
            return Err(PashaError::WalWriteFailed(format!(
                "record lsn {} does not match segment position {expected}",
                record.lsn
            )));
        }
        let data = record.serialize();
        if !self.has_space(data.len()) {
            return Err(PashaError::WalWriteFailed(format!(
                "{} full at offset {}",
                self.header.segment_id, self.write_offset
            )));
        }
        self.file.write_all(&data)?;
        self.write_offset += data.len() as u32;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Reads a whole segment file and returns its header and decoded records.
pub async fn read_segment(path: &Path) -> Result<(SegmentHeader, Vec<LogRecord>)> {
    let data = tokio::fs::read(path).await?;
    let header = SegmentHeader::decode(&data)?;
    let records = LogRecord::parse_all(&data[SegmentHeader::SIZE..])?;
    Ok((header, records))
}
