//! Per-access records kept in a transaction's key sets.

use bytes::Bytes;
use pasha_common::{Key, PartitionId, TableId, Tid};
use pasha_cxl::{CxlPool, SharedHandle, SharedRow};
use pasha_storage::LocalRow;
use std::sync::Arc;

/// Lock requested on a tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    Read,
    Write,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LockMode::Read => "read",
            LockMode::Write => "write",
        })
    }
}

/// A reference count held on a shared tuple.
///
/// Dropping the guard gives the count back, so every exit path of a
/// transaction attempt releases it exactly once. Must not be dropped while
/// the tuple's latch is held.
pub struct SharedRowRef {
    pool: Arc<CxlPool>,
    handle: SharedHandle<SharedRow>,
}

impl SharedRowRef {
    /// Takes ownership of a reference count already added to `handle`.
    pub fn adopt(pool: Arc<CxlPool>, handle: SharedHandle<SharedRow>) -> Self {
        Self { pool, handle }
    }

    #[inline]
    pub fn handle(&self) -> SharedHandle<SharedRow> {
        self.handle
    }
}

impl Drop for SharedRowRef {
    fn drop(&mut self) {
        self.pool.resolve_row(self.handle).lock().dec_ref_cnt();
        self.pool.note_ref_released();
    }
}

impl std::fmt::Debug for SharedRowRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedRowRef").field(&self.handle).finish()
    }
}

/// Where a locked tuple lives for this transaction.
#[derive(Debug)]
pub enum RowTarget {
    /// Owned by this host. Accesses go through the local row, which follows
    /// the tuple into the shared region while it is migrated.
    Local(Arc<LocalRow>),
    /// Owned by another host and accessed in place in the shared region.
    Shared(SharedRowRef),
}

impl RowTarget {
    /// Returns true if the target pins a shared tuple with a reference count.
    pub fn is_reference_counted(&self) -> bool {
        matches!(self, RowTarget::Shared(_))
    }
}

/// One entry of the read set. Writes and deletes also start here: the
/// write lock is requested through the read set and the write set points
/// back at the entry.
#[derive(Debug)]
pub struct TwoPlPashaRwKey {
    pub table: TableId,
    pub partition: PartitionId,
    pub key: Key,
    pub mode: LockMode,
    /// Unlocked read of a table every host keeps locally.
    pub local_index_read: bool,
    pub value: Bytes,
    pub tid: Tid,
    pub granted: bool,
    pub processed: bool,
    /// Written or deleted by this transaction.
    pub dirty: bool,
    pub target: Option<RowTarget>,
}

impl TwoPlPashaRwKey {
    pub fn new(table: TableId, partition: PartitionId, key: Key, mode: LockMode) -> Self {
        Self {
            table,
            partition,
            key,
            mode,
            local_index_read: false,
            value: Bytes::new(),
            tid: 0,
            granted: false,
            processed: false,
            dirty: false,
            target: None,
        }
    }

    pub fn is_reference_counted(&self) -> bool {
        self.target.as_ref().is_some_and(RowTarget::is_reference_counted)
    }

    /// Records a granted lock.
    pub fn grant(&mut self, tid: Tid, value: Bytes, target: RowTarget) {
        self.tid = tid;
        self.value = value;
        self.target = Some(target);
        self.granted = true;
    }
}

/// Scan flavour. Row locks and the next-key lock follow from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanKind {
    Read,
    Update,
    /// Scan guarding a later insert into the range.
    Insert,
    Delete,
}

impl ScanKind {
    pub fn row_mode(self) -> LockMode {
        match self {
            ScanKind::Read | ScanKind::Insert => LockMode::Read,
            ScanKind::Update | ScanKind::Delete => LockMode::Write,
        }
    }

    pub fn next_key_mode(self) -> LockMode {
        match self {
            ScanKind::Read | ScanKind::Update => LockMode::Read,
            ScanKind::Insert | ScanKind::Delete => LockMode::Write,
        }
    }
}

/// A locked row returned by a scan, or the next-key row past its range.
#[derive(Debug)]
pub struct ScanRow {
    pub key: Key,
    pub value: Bytes,
    pub tid: Tid,
    pub mode: LockMode,
    pub dirty: bool,
    pub target: RowTarget,
}

/// One entry of the scan set. Rows with `min_key <= key <= max_key` are
/// returned in key order, at most `limit` of them.
#[derive(Debug)]
pub struct ScanKey {
    pub table: TableId,
    pub partition: PartitionId,
    pub min_key: Key,
    pub max_key: Key,
    pub limit: usize,
    pub kind: ScanKind,
    pub rows: Vec<ScanRow>,
    pub next_row: Option<ScanRow>,
    pub processed: bool,
}

impl ScanKey {
    pub fn new(
        table: TableId,
        partition: PartitionId,
        min_key: Key,
        max_key: Key,
        limit: usize,
        kind: ScanKind,
    ) -> Self {
        Self {
            table,
            partition,
            min_key,
            max_key,
            limit,
            kind,
            rows: Vec::new(),
            next_row: None,
            processed: false,
        }
    }

    /// Returns true once a row at `key` falls outside the requested range.
    #[inline]
    pub fn is_past_range(&self, key: Key, returned: usize) -> bool {
        past_range(key, self.max_key, self.limit, returned)
    }
}

/// Returns true once a row at `key` ends a scan bounded by `max_key` that
/// has already returned `returned` rows. The end-of-table placeholder
/// always ends it.
#[inline]
pub fn past_range(key: Key, max_key: Key, limit: usize, returned: usize) -> bool {
    key > max_key || key == pasha_storage::MAX_KEY || returned >= limit
}

/// One entry of the insert set.
#[derive(Debug)]
pub struct InsertKey {
    pub table: TableId,
    pub partition: PartitionId,
    pub key: Key,
    pub value: Bytes,
    pub require_lock_next_key: bool,
    pub processed: bool,
    /// The write-locked placeholder, once inserted.
    pub target: Option<RowTarget>,
    /// Write lock held on the successor of the new key.
    pub next_row: Option<Arc<LocalRow>>,
}

/// Location of a locked row within a transaction's key sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLoc {
    Read(usize),
    Scan(usize, usize),
}

/// One entry of the delete set.
///
/// On ordered tables the victim is locked by a single-key delete scan,
/// which also write-locks its successor. Elsewhere it is a write-locked
/// read-set entry.
#[derive(Debug)]
pub struct DeleteKey {
    pub table: TableId,
    pub partition: PartitionId,
    pub key: Key,
    pub loc: RowLoc,
    pub processed: bool,
}

/// One entry of the write set.
#[derive(Debug)]
pub struct WriteKey {
    pub loc: RowLoc,
    pub value: Bytes,
}
