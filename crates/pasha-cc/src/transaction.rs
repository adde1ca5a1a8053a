//! Transaction state and key sets.

use crate::rwkey::{
    DeleteKey, InsertKey, LockMode, RowLoc, RowTarget, ScanKey, TwoPlPashaRwKey, WriteKey,
};
use bytes::Bytes;
use pasha_common::{HostId, Key, PartitionId, TableId, Tid};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// Lifecycle of one transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnState {
    Active,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TxnState {
    fn can_become(self, next: TxnState) -> bool {
        use TxnState::*;
        matches!(
            (self, next),
            (Active, Committing) | (Active, Aborting) | (Committing, Committed) | (Committing, Aborting) | (Aborting, Aborted)
        )
    }
}

/// Why an attempt aborted. Every reason is retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// A row could not be locked or no longer exists.
    LockConflict,
    /// The key was taken or its gap is locked.
    InsertConflict,
    /// The victim or its successor could not be locked.
    DeleteConflict,
    /// The owner could not move a tuple into the shared region.
    MigrationFailed,
    /// The transaction logic gave up.
    Requested,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AbortReason::LockConflict => "lock conflict",
            AbortReason::InsertConflict => "insert conflict",
            AbortReason::DeleteConflict => "delete conflict",
            AbortReason::MigrationFailed => "migration failed",
            AbortReason::Requested => "requested",
        })
    }
}

/// Final result of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed { commit_tid: Tid },
    Aborted(AbortReason),
}

impl TxnOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TxnOutcome::Committed { .. })
    }
}

/// Key sets and flags of one transaction attempt.
#[derive(Debug)]
pub struct TwoPlPashaTransaction {
    id: u64,
    start: Instant,
    state: TxnState,
    pub read_set: Vec<TwoPlPashaRwKey>,
    pub write_set: Vec<WriteKey>,
    pub scan_set: Vec<ScanKey>,
    pub insert_set: Vec<InsertKey>,
    pub delete_set: Vec<DeleteKey>,
    pub abort_lock: bool,
    pub abort_insert: bool,
    pub abort_delete: bool,
    pub abort_migration: bool,
    pub distributed_transaction: bool,
    pub pending_responses: usize,
    /// Remote partitions touched, grouped by owner, for move-out hints.
    pub remote_partitions: BTreeMap<HostId, BTreeSet<PartitionId>>,
    pub commit_tid: Option<Tid>,
}

impl TwoPlPashaTransaction {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            start: Instant::now(),
            state: TxnState::Active,
            read_set: Vec::new(),
            write_set: Vec::new(),
            scan_set: Vec::new(),
            insert_set: Vec::new(),
            delete_set: Vec::new(),
            abort_lock: false,
            abort_insert: false,
            abort_delete: false,
            abort_migration: false,
            distributed_transaction: false,
            pending_responses: 0,
            remote_partitions: BTreeMap::new(),
            commit_tid: None,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn start(&self) -> Instant {
        self.start
    }

    #[inline]
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Moves to `next`.
    ///
    /// # Panics
    ///
    /// Panics on a transition the lifecycle does not allow.
    pub fn transition(&mut self, next: TxnState) {
        assert!(
            self.state.can_become(next),
            "transaction {} cannot go from {:?} to {:?}",
            self.id,
            self.state,
            next
        );
        self.state = next;
    }

    /// Returns true if any failure flag is set.
    pub fn should_abort(&self) -> bool {
        self.abort_lock || self.abort_insert || self.abort_delete || self.abort_migration
    }

    /// Returns the first failure recorded, if any.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        if self.abort_migration {
            Some(AbortReason::MigrationFailed)
        } else if self.abort_insert {
            Some(AbortReason::InsertConflict)
        } else if self.abort_delete {
            Some(AbortReason::DeleteConflict)
        } else if self.abort_lock {
            Some(AbortReason::LockConflict)
        } else {
            None
        }
    }

    /// Records an access to a partition owned by another host.
    pub fn note_remote(&mut self, owner: HostId, partition: PartitionId) {
        self.distributed_transaction = true;
        self.remote_partitions.entry(owner).or_default().insert(partition);
    }

    /// Finds a read-set entry for the key.
    pub fn find_read(&self, table: TableId, partition: PartitionId, key: Key) -> Option<usize> {
        self.read_set
            .iter()
            .position(|k| k.table == table && k.partition == partition && k.key == key)
    }

    /// Adds a read-set entry, reusing an existing entry for the same key.
    ///
    /// A key already held with an equal or stronger lock is reused. Asking
    /// for a write lock on a key this transaction already read-locked
    /// dooms the attempt: the lock word does not record which transaction
    /// holds a read lock, so the upgrade cannot be told apart from a
    /// conflict. A locked request for a key so far only read through the
    /// local index turns that entry into a lock request, processed again
    /// by the next batch.
    pub fn add_read_key(
        &mut self,
        table: TableId,
        partition: PartitionId,
        key: Key,
        mode: LockMode,
        local_index_read: bool,
    ) -> usize {
        if let Some(i) = self.find_read(table, partition, key) {
            let existing = &mut self.read_set[i];
            if existing.local_index_read {
                if !local_index_read {
                    existing.local_index_read = false;
                    existing.mode = mode;
                    existing.granted = false;
                    existing.processed = false;
                    existing.target = None;
                }
            } else if existing.mode < mode {
                self.abort_lock = true;
            }
            return i;
        }
        let mut entry = TwoPlPashaRwKey::new(table, partition, key, mode);
        entry.local_index_read = local_index_read;
        self.read_set.push(entry);
        self.read_set.len() - 1
    }

    /// Buffers a new value for a write-locked row, replacing an earlier
    /// write to the same row.
    pub fn add_write(&mut self, loc: RowLoc, value: Bytes) {
        match self.write_set.iter_mut().find(|w| w.loc == loc) {
            Some(w) => w.value = value,
            None => self.write_set.push(WriteKey { loc, value }),
        }
    }

    /// Key and lock target of a locked row.
    ///
    /// # Panics
    ///
    /// Panics if `loc` points past the key sets.
    pub fn row_at(&self, loc: RowLoc) -> (TableId, PartitionId, Key, Option<&RowTarget>) {
        match loc {
            RowLoc::Read(i) => {
                let k = &self.read_set[i];
                (k.table, k.partition, k.key, k.target.as_ref())
            }
            RowLoc::Scan(s, r) => {
                let scan = &self.scan_set[s];
                let row = &scan.rows[r];
                (scan.table, scan.partition, row.key, Some(&row.target))
            }
        }
    }

    /// Marks a locked row as written, so its lock is released with the
    /// commit timestamp.
    pub fn mark_dirty(&mut self, loc: RowLoc) {
        match loc {
            RowLoc::Read(i) => self.read_set[i].dirty = true,
            RowLoc::Scan(s, r) => self.scan_set[s].rows[r].dirty = true,
        }
    }

    /// Drops every reference-count guard. Local targets stay in place.
    pub fn release_references(&mut self) {
        for k in &mut self.read_set {
            if k.is_reference_counted() {
                k.target = None;
            }
        }
        for scan in &mut self.scan_set {
            scan.rows.retain(|r| !r.target.is_reference_counted());
            if scan.next_row.as_ref().is_some_and(|r| r.target.is_reference_counted()) {
                scan.next_row = None;
            }
        }
        for k in &mut self.insert_set {
            if k.target.as_ref().is_some_and(RowTarget::is_reference_counted) {
                k.target = None;
            }
        }
    }

    /// Value read for a read-set entry.
    pub fn value(&self, index: usize) -> &Bytes {
        &self.read_set[index].value
    }

    /// Number of reference counts currently held by this attempt.
    pub fn reference_counts_held(&self) -> usize {
        let reads = self.read_set.iter().filter(|k| k.is_reference_counted()).count();
        let scans: usize = self
            .scan_set
            .iter()
            .map(|s| {
                s.rows.iter().filter(|r| r.target.is_reference_counted()).count()
                    + s.next_row
                        .as_ref()
                        .map_or(0, |r| r.target.is_reference_counted() as usize)
            })
            .sum();
        let inserts = self
            .insert_set
            .iter()
            .filter(|k| k.target.as_ref().is_some_and(|t| t.is_reference_counted()))
            .count();
        reads + scans + inserts
    }

    /// Clears every set and flag for a fresh attempt under a new id.
    /// Reference counts still held are released by dropping their guards.
    pub fn reset(&mut self, id: u64) {
        self.id = id;
        self.read_set.clear();
        self.write_set.clear();
        self.scan_set.clear();
        self.insert_set.clear();
        self.delete_set.clear();
        self.abort_lock = false;
        self.abort_insert = false;
        self.abort_delete = false;
        self.abort_migration = false;
        self.distributed_transaction = false;
        self.pending_responses = 0;
        self.remote_partitions.clear();
        self.commit_tid = None;
        self.start = Instant::now();
        self.state = TxnState::Active;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let mut txn = TwoPlPashaTransaction::new(1);
        assert_eq!(txn.state(), TxnState::Active);
        txn.transition(TxnState::Committing);
        txn.transition(TxnState::Committed);
        assert_eq!(txn.state(), TxnState::Committed);
    }

    #[test]
    #[should_panic(expected = "cannot go from Aborted to Committing")]
    fn test_illegal_transition_panics() {
        let mut txn = TwoPlPashaTransaction::new(2);
        txn.transition(TxnState::Aborting);
        txn.transition(TxnState::Aborted);
        txn.transition(TxnState::Committing);
    }

    #[test]
    fn test_repeated_key_reuses_entry() {
        let mut txn = TwoPlPashaTransaction::new(3);
        let a = txn.add_read_key(TableId(0), PartitionId(0), 7, LockMode::Write, false);
        let b = txn.add_read_key(TableId(0), PartitionId(0), 7, LockMode::Read, false);
        assert_eq!(a, b);
        assert_eq!(txn.read_set.len(), 1);
        assert!(!txn.should_abort());
    }

    #[test]
    fn test_upgrade_dooms_attempt() {
        let mut txn = TwoPlPashaTransaction::new(4);
        txn.add_read_key(TableId(0), PartitionId(0), 7, LockMode::Read, false);
        txn.add_read_key(TableId(0), PartitionId(0), 7, LockMode::Write, false);
        assert_eq!(txn.abort_reason(), Some(AbortReason::LockConflict));
    }

    #[test]
    fn test_lock_after_local_index_read_rearms_entry() {
        let mut txn = TwoPlPashaTransaction::new(4);
        let a = txn.add_read_key(TableId(0), PartitionId(0), 7, LockMode::Read, true);
        txn.read_set[a].processed = true;
        txn.read_set[a].granted = true;
        let b = txn.add_read_key(TableId(0), PartitionId(0), 7, LockMode::Write, false);
        assert_eq!(a, b);
        let entry = &txn.read_set[b];
        assert_eq!(entry.mode, LockMode::Write);
        assert!(!entry.local_index_read && !entry.processed && !entry.granted);
        assert!(!txn.should_abort());
    }

    #[test]
    fn test_abort_reason_priority() {
        let mut txn = TwoPlPashaTransaction::new(5);
        assert_eq!(txn.abort_reason(), None);
        txn.abort_lock = true;
        txn.abort_insert = true;
        assert_eq!(txn.abort_reason(), Some(AbortReason::InsertConflict));
    }

    #[test]
    fn test_write_replaces_earlier_value() {
        let mut txn = TwoPlPashaTransaction::new(6);
        txn.add_write(RowLoc::Read(0), Bytes::from_static(b"a"));
        txn.add_write(RowLoc::Read(0), Bytes::from_static(b"b"));
        assert_eq!(txn.write_set.len(), 1);
        assert_eq!(&txn.write_set[0].value[..], b"b");
    }

    #[test]
    fn test_mark_dirty_and_row_at() {
        let mut txn = TwoPlPashaTransaction::new(9);
        let i = txn.add_read_key(TableId(2), PartitionId(1), 40, LockMode::Write, false);
        txn.mark_dirty(RowLoc::Read(i));
        assert!(txn.read_set[i].dirty);
        let (table, partition, key, target) = txn.row_at(RowLoc::Read(i));
        assert_eq!((table, partition, key), (TableId(2), PartitionId(1), 40));
        assert!(target.is_none());
    }

    #[test]
    fn test_release_references_drops_guards() {
        use pasha_cxl::{CxlPool, CxlPoolConfig, RegionKey};
        use std::sync::Arc;

        let pool = Arc::new(CxlPool::new(CxlPoolConfig {
            capacity_bytes: 1 << 20,
            row_slots: 4,
        }));
        let h = pool
            .malloc_row(RegionKey::new(TableId(0), PartitionId(0), 1), 8)
            .unwrap();
        pool.resolve_row(h).lock().inc_ref_cnt();
        pool.note_ref_acquired();

        let mut txn = TwoPlPashaTransaction::new(10);
        let i = txn.add_read_key(TableId(0), PartitionId(0), 1, LockMode::Read, false);
        let guard = crate::rwkey::SharedRowRef::adopt(Arc::clone(&pool), h);
        txn.read_set[i].grant(0, Bytes::new(), RowTarget::Shared(guard));
        assert_eq!(txn.reference_counts_held(), 1);

        txn.release_references();
        assert_eq!(txn.reference_counts_held(), 0);
        assert_eq!(pool.resolve_row(h).lock().ref_cnt, 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut txn = TwoPlPashaTransaction::new(7);
        txn.add_read_key(TableId(1), PartitionId(2), 3, LockMode::Read, false);
        txn.note_remote(HostId(1), PartitionId(2));
        txn.abort_delete = true;
        txn.transition(TxnState::Aborting);
        txn.reset(8);
        assert_eq!(txn.id(), 8);
        assert!(txn.read_set.is_empty());
        assert!(txn.remote_partitions.is_empty());
        assert!(!txn.should_abort());
        assert!(!txn.distributed_transaction);
        assert_eq!(txn.state(), TxnState::Active);
    }
}
