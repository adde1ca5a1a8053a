//! Redo logging for Pasha transactions.
//!
//! Commit hands each modified tuple's new image to a [`Logger`] before any
//! lock is released. [`WalWriter`] appends those images to checksummed
//! segment files; [`WalReader`] scans them back.

pub mod logger;
pub mod reader;
pub mod record;
pub mod segment;
pub mod writer;

pub use logger::{Logger, NullLogger};
pub use reader::WalReader;
pub use record::{LogRecord, LogRecordType, Lsn, RedoOp, RedoPayload, FLAG_PERSISTED};
pub use segment::{LogSegment, SegmentHeader, SegmentId};
pub use writer::{WalStats, WalWriter, WalWriterConfig};
