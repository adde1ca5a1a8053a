//! Segment-rotating redo log writer.

use crate::logger::Logger;
use crate::record::{LogRecord, Lsn, FLAG_PERSISTED};
use crate::segment::{LogSegment, SegmentId};
use bytes::Bytes;
use parking_lot::Mutex;
use pasha_common::{PashaConfig, PashaError, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Configuration for the WAL writer.
#[derive(Debug, Clone)]
pub struct WalWriterConfig {
    /// Directory holding segment files.
    pub wal_dir: PathBuf,
    /// Maximum bytes per segment file.
    pub segment_capacity: u32,
    /// Host stamped into segment headers.
    pub host: u32,
    /// Honour `persist` by syncing. Tests turn this off.
    pub fsync_enabled: bool,
}

impl Default for WalWriterConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("./data/redo"),
            segment_capacity: LogSegment::DEFAULT_CAPACITY,
            host: 0,
            fsync_enabled: true,
        }
    }
}

impl WalWriterConfig {
    /// Builds the per-host writer configuration, or None when redo logging
    /// is disabled.
    pub fn for_host(config: &PashaConfig, host: u32) -> Option<Self> {
        if !config.persist_log {
            return None;
        }
        let dir = config.wal_dir.as_ref()?;
        Some(Self {
            wal_dir: dir.join(format!("host{host}")),
            host,
            ..Default::default()
        })
    }
}

/// Writer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalStats {
    pub records_written: u64,
    pub bytes_written: u64,
    pub syncs: u64,
    pub segments_created: u64,
    /// Sum over persisted writes of the time since transaction start.
    pub persist_latency_us: u64,
}

struct WriterState {
    segment: Option<LogSegment>,
    last_lsn: Lsn,
}

/// Thread-safe redo log writer.
pub struct WalWriter {
    config: WalWriterConfig,
    state: Mutex<WriterState>,
    flushed_lsn: AtomicU64,
    records_written: AtomicU64,
    bytes_written: AtomicU64,
    syncs: AtomicU64,
    segments_created: AtomicU64,
    persist_latency_us: AtomicU64,
}

impl WalWriter {
    pub fn new(config: WalWriterConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.wal_dir)?;
        let (segment, created) = Self::open_latest_or_create(&config)?;
        let next = Lsn::new(segment.segment_id().0, segment.write_offset());
        info!(dir = %config.wal_dir.display(), segment = %segment.segment_id(), "redo log opened");

        Ok(Self {
            config,
            state: Mutex::new(WriterState {
                segment: Some(segment),
                last_lsn: Lsn::INVALID,
            }),
            flushed_lsn: AtomicU64::new(next.0),
            records_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
            segments_created: AtomicU64::new(created as u64),
            persist_latency_us: AtomicU64::new(0),
        })
    }

    fn open_latest_or_create(config: &WalWriterConfig) -> Result<(LogSegment, bool)> {
        let latest = std::fs::read_dir(&config.wal_dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| SegmentId::from_path(&e.path()).map(|id| (id, e.path())))
            .max_by_key(|(id, _)| *id);

        match latest {
            Some((_, path)) => Ok((LogSegment::open(&path)?, false)),
            None => {
                let seg = LogSegment::create(
                    &config.wal_dir,
                    SegmentId::FIRST,
                    config.segment_capacity,
                    config.host,
                )?;
                Ok((seg, true))
            }
        }
    }

    pub fn wal_dir(&self) -> &Path {
        &self.config.wal_dir
    }

    /// LSN the next record will receive, ignoring rotation.
    pub fn next_lsn(&self) -> Lsn {
        let state = self.state.lock();
        state
            .segment
            .as_ref()
            .map(|s| Lsn::new(s.segment_id().0, s.write_offset()))
            .unwrap_or(Lsn::INVALID)
    }

    /// Everything before this LSN is durable.
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn(self.flushed_lsn.load(Ordering::Acquire))
    }

    pub fn current_segment_id(&self) -> Option<SegmentId> {
        self.state.lock().segment.as_ref().map(|s| s.segment_id())
    }

    /// Appends a record, rotating to a fresh segment when the current one
    /// cannot hold it. Returns the record's LSN.
    pub fn append(&self, mut record: LogRecord, persist: bool) -> Result<Lsn> {
        let size = record.size_on_disk();
        let mut state = self.state.lock();
        let last_lsn = state.last_lsn;
        let segment = state
            .segment
            .as_mut()
            .ok_or_else(|| PashaError::WalWriteFailed("redo log closed".to_string()))?;

        if !segment.has_space(size) {
            segment.sync()?;
            let next_id = segment.segment_id().next();
            *segment = LogSegment::create(
                &self.config.wal_dir,
                next_id,
                self.config.segment_capacity,
                self.config.host,
            )?;
            self.segments_created.fetch_add(1, Ordering::Relaxed);
            debug!(segment = %next_id, "rotated redo segment");
            if !segment.has_space(size) {
                return Err(PashaError::WalWriteFailed(format!(
                    "record of {size} bytes exceeds segment capacity"
                )));
            }
        }

        record.lsn = Lsn::new(segment.segment_id().0, segment.write_offset());
        record.prev_lsn = last_lsn;
        let sync_now = persist && self.config.fsync_enabled;
        if sync_now {
            record.flags |= FLAG_PERSISTED;
        }
        segment.append(&record)?;
        let end = Lsn::new(segment.segment_id().0, segment.write_offset());
        if sync_now {
            segment.sync()?;
            self.syncs.fetch_add(1, Ordering::Relaxed);
            self.flushed_lsn.fetch_max(end.0, Ordering::AcqRel);
        }
        state.last_lsn = record.lsn;

        self.records_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(size as u64, Ordering::Relaxed);
        Ok(record.lsn)
    }

    /// Syncs the current segment.
    pub fn flush(&self) -> Result<Lsn> {
        let mut state = self.state.lock();
        let Some(segment) = state.segment.as_mut() else {
            return Ok(Lsn::INVALID);
        };
        segment.sync()?;
        let end = Lsn::new(segment.segment_id().0, segment.write_offset());
        self.syncs.fetch_add(1, Ordering::Relaxed);
        self.flushed_lsn.fetch_max(end.0, Ordering::AcqRel);
        Ok(end)
    }

    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(mut segment) = state.segment.take() {
            segment.sync()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> WalStats {
        WalStats {
            records_written: self.records_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
            segments_created: self.segments_created.load(Ordering::Relaxed),
            persist_latency_us: self.persist_latency_us.load(Ordering::Relaxed),
        }
    }
}

impl Logger for WalWriter {
    fn write(&self, bytes: &[u8], persist: bool, txn_start: Instant) -> Result<Lsn> {
        let lsn = self.append(LogRecord::redo(Bytes::copy_from_slice(bytes)), persist)?;
        if persist {
            self.persist_latency_us
                .fetch_add(txn_start.elapsed().as_micros() as u64, Ordering::Relaxed);
        }
        Ok(lsn)
    }

    fn sync(&self, lsn: Lsn) -> Result<()> {
        if !self.config.fsync_enabled || self.flushed_lsn() > lsn {
            return Ok(());
        }
        self.flush().map(|_| ())
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
