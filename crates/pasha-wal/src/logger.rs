//! The logging seam used by transaction commit.

use crate::record::Lsn;
use pasha_common::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Sink for redo records.
///
/// Commit writes one encoded redo payload per modified tuple. With
/// `persist` set the record, and everything logged before it, is durable
/// when `write` returns. `txn_start` feeds commit-latency accounting.
pub trait Logger: Send + Sync {
    fn write(&self, bytes: &[u8], persist: bool, txn_start: Instant) -> Result<Lsn>;

    /// Makes every record up to `lsn` durable.
    fn sync(&self, lsn: Lsn) -> Result<()>;
}

/// Logger that drops every record. Used when `persist_log` is off.
#[derive(Debug, Default)]
pub struct NullLogger {
    next: AtomicU64,
}

impl NullLogger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Logger for NullLogger {
    fn write(&self, _bytes: &[u8], _persist: bool, _txn_start: Instant) -> Result<Lsn> {
        Ok(Lsn(self.next.fetch_add(1, Ordering::Relaxed) + 1))
    }

    fn sync(&self, _lsn: Lsn) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_logger_issues_increasing_lsns() {
        let logger = NullLogger::new();
        let a = logger.write(b"a", false, Instant::now()).unwrap();
        let b = logger.write(b"b", true, Instant::now()).unwrap();
        assert!(a.is_valid());
        assert!(b > a);
        logger.sync(b).unwrap();
    }

    #[test]
    fn test_logger_is_object_safe() {
        let logger: Box<dyn Logger> = Box::new(NullLogger::new());
        assert!(logger.write(&[], false, Instant::now()).is_ok());
    }
}
