//! Asynchronous redo log reader.

use crate::record::{LogRecord, LogRecordType, Lsn, RedoPayload};
use crate::segment::{read_segment, SegmentId};
use pasha_common::{PashaError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Scans the segment files of one redo log directory.
pub struct WalReader {
    segments: BTreeMap<SegmentId, PathBuf>,
}

impl WalReader {
    pub async fn new(wal_dir: &Path) -> Result<Self> {
        let mut segments = BTreeMap::new();
        if tokio::fs::try_exists(wal_dir).await? {
            let mut dir = tokio::fs::read_dir(wal_dir).await?;
            while let Some(entry) = dir.next_entry().await? {
                let path = entry.path();
                if let Some(id) = SegmentId::from_path(&path) {
                    segments.insert(id, path);
                }
            }
        }
        debug!(dir = %wal_dir.display(), segments = segments.len(), "opened redo log for reading");
        Ok(Self { segments })
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns every record in LSN order.
    pub async fn scan_all(&self) -> Result<Vec<LogRecord>> {
        self.scan_from(Lsn::INVALID).await
    }

    /// Returns every record at or after `start`.
    pub async fn scan_from(&self, start: Lsn) -> Result<Vec<LogRecord>> {
        let mut out = Vec::new();
        for (id, path) in self.segments.range(SegmentId(start.segment_id())..) {
            let (header, records) = read_segment(path).await?;
            if header.segment_id != *id {
                return Err(PashaError::WalCorrupted {
                    lsn: 0,
                    reason: format!("{} carries header for {}", path.display(), header.segment_id),
                });
            }
            out.extend(records.into_iter().filter(|r| r.lsn >= start));
        }
        Ok(out)
    }

    /// Decodes the redo payloads of every record.
    pub async fn redo_payloads(&self) -> Result<Vec<(Lsn, RedoPayload)>> {
        self.scan_all()
            .await?
            .into_iter()
            .filter(|r| r.record_type == LogRecordType::Redo)
            .map(|r| RedoPayload::decode(&r.payload).map(|p| (r.lsn, p)))
            .collect()
    }
}
