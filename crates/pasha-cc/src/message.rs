//! Messages exchanged between hosts.
//!
//! Requests go to the owner host of a partition and are served by whichever
//! of its workers picks them up. Responses go back to the requesting worker
//! and carry the slot of the key-set entry they answer. Shared handles are
//! valid on every host, so responses hand them over directly.

use crate::rwkey::LockMode;
use bytes::Bytes;
use pasha_common::{Key, PartitionId, TableId, WorkerId};
use pasha_cxl::{SharedHandle, SharedRow};

/// A message with its routing header.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub from: WorkerId,
    /// Transaction attempt the message belongs to. Responses to an attempt
    /// that has since finished are stale.
    pub txn_id: u64,
    pub body: T,
}

/// Owner-side work requested by a remote worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Move one tuple into the shared region and pin it for the requester.
    DataMigration {
        table: TableId,
        partition: PartitionId,
        key: Key,
        slot: usize,
    },
    /// Migrate, pin and lock every tuple of a range plus the next key.
    DataMigrationForScan {
        table: TableId,
        partition: PartitionId,
        min_key: Key,
        max_key: Key,
        limit: usize,
        row_mode: LockMode,
        next_mode: Option<LockMode>,
        slot: usize,
    },
    /// Run a move-out round on the listed partitions.
    MoveOutHint { partitions: Vec<PartitionId> },
    /// Insert a write-locked placeholder and migrate it for the requester.
    RemoteInsert {
        table: TableId,
        partition: PartitionId,
        key: Key,
        value: Bytes,
        lock_next: bool,
        slot: usize,
    },
    /// Remove a tuple whose deletion committed, or an aborted placeholder.
    RemoteDelete {
        table: TableId,
        partition: PartitionId,
        key: Key,
    },
}

/// Outcome of a single-tuple migration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    /// In the shared region, with a reference count for the requester.
    Migrated,
    NotFound,
    OutOfMemory,
}

/// Outcome of a range request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// Every listed row, and the next row if present, is migrated, pinned
    /// and locked on the requester's behalf.
    Granted,
    /// A row could not be locked, or the range changed while locking.
    Conflict,
    /// The shared region had no room for a row of the range.
    OutOfMemory,
}

/// Owner's answer to a request that expects one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    DataMigration {
        slot: usize,
        status: MigrationStatus,
        /// Set when `status` is `Migrated`.
        handle: Option<SharedHandle<SharedRow>>,
    },
    /// Rows are listed only when `status` is `Granted`.
    DataMigrationForScan {
        slot: usize,
        status: ScanStatus,
        rows: Vec<(Key, SharedHandle<SharedRow>)>,
        next: Option<(Key, SharedHandle<SharedRow>)>,
        row_mode: LockMode,
        next_mode: Option<LockMode>,
    },
    /// On success the placeholder is migrated, pinned and write-locked on
    /// the requester's behalf.
    RemoteInsert {
        slot: usize,
        handle: Option<SharedHandle<SharedRow>>,
    },
}
