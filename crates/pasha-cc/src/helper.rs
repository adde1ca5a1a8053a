//! Tuple-level operations of migration-aware two-phase locking.
//!
//! A tuple owned by this host is always reached through its [`LocalRow`].
//! While it is migrated, the lock word, validity bit and bytes of the shared
//! copy are authoritative. Tuples owned by other hosts are reached only
//! through shared handles.
//!
//! Latch order is table structure, then local latch, then shared latch.
//! Neighbour latches are only taken inside table adjacency processors, which
//! run with the table structure locked exclusively.

use crate::migration::{MigrationResult, MoveOutStatus};
use crate::rwkey::LockMode;
use bytes::Bytes;
use pasha_common::{HostId, Key, PashaConfig, Tid, WorkerId};
use pasha_cxl::{
    AllocCategory, CxlPool, Ebr, LockWord, RegionKey, SccManager, SharedHandle, SharedIndex,
    SharedRow, SharedRowState, INDEX_ENTRY_BYTES, SHARED_ROW_METADATA_BYTES,
};
use pasha_storage::{LocalRow, LocalRowState, RowEntry, Table};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Next-key handling for inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextKeyLock {
    /// Leave the successor alone.
    None,
    /// Fail if the successor is locked, without keeping a lock.
    Probe,
    /// Write-lock the successor and hand the lock to the caller.
    Hold,
}

#[derive(Debug, Default)]
struct HelperMetrics {
    num_data_move_in: AtomicU64,
    num_data_move_out: AtomicU64,
    num_local_cxl_access: AtomicU64,
    num_remote_cxl_access: AtomicU64,
}

/// Point-in-time view of helper activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HelperStats {
    pub num_data_move_in: u64,
    pub num_data_move_out: u64,
    /// Owner accesses that followed a tuple into the shared region.
    pub num_local_cxl_access: u64,
    /// Accesses to tuples owned by other hosts.
    pub num_remote_cxl_access: u64,
}

/// Per-host protocol state shared by the host's workers.
pub struct TwoPlPashaHelper {
    host: HostId,
    pool: Arc<CxlPool>,
    index: Arc<SharedIndex>,
    scc: Arc<dyn SccManager>,
    ebr: Arc<Ebr>,
    enable_phantom_detection: bool,
    enable_migration_optimization: bool,
    metrics: HelperMetrics,
}

#[inline]
fn take_lock(word: &mut LockWord, mode: LockMode) -> Option<Tid> {
    *word = match mode {
        LockMode::Read => word.try_read_lock()?,
        LockMode::Write => word.try_write_lock()?,
    };
    Some(word.version())
}

#[inline]
fn release_lock_word(word: LockWord, mode: LockMode, commit_tid: Option<Tid>) -> LockWord {
    match (mode, commit_tid) {
        (LockMode::Read, _) => word.read_unlock(),
        (LockMode::Write, Some(tid)) => word.write_unlock_with(tid),
        (LockMode::Write, None) => word.write_unlock(),
    }
}

impl TwoPlPashaHelper {
    pub fn new(
        host: HostId,
        pool: Arc<CxlPool>,
        index: Arc<SharedIndex>,
        scc: Arc<dyn SccManager>,
        ebr: Arc<Ebr>,
        config: &PashaConfig,
    ) -> Self {
        Self {
            host,
            pool,
            index,
            scc,
            ebr,
            enable_phantom_detection: config.enable_phantom_detection,
            enable_migration_optimization: config.enable_migration_optimization,
            metrics: HelperMetrics::default(),
        }
    }

    pub fn host(&self) -> HostId {
        self.host
    }

    pub fn pool(&self) -> &Arc<CxlPool> {
        &self.pool
    }

    pub fn index(&self) -> &Arc<SharedIndex> {
        &self.index
    }

    pub fn scc(&self) -> &Arc<dyn SccManager> {
        &self.scc
    }

    pub fn ebr(&self) -> &Arc<Ebr> {
        &self.ebr
    }

    pub fn enable_phantom_detection(&self) -> bool {
        self.enable_phantom_detection
    }

    pub fn stats(&self) -> HelperStats {
        HelperStats {
            num_data_move_in: self.metrics.num_data_move_in.load(Ordering::Relaxed),
            num_data_move_out: self.metrics.num_data_move_out.load(Ordering::Relaxed),
            num_local_cxl_access: self.metrics.num_local_cxl_access.load(Ordering::Relaxed),
            num_remote_cxl_access: self.metrics.num_remote_cxl_access.load(Ordering::Relaxed),
        }
    }

    /// Index key of a tuple of `table`.
    pub fn region_key(table: &dyn Table, key: Key) -> RegionKey {
        RegionKey::new(table.table_id(), table.partition_id(), table.get_plain_key(key))
    }

    fn observe_metadata(&self, shared: &mut SharedRowState) {
        let word = shared.lock_word.raw().to_le_bytes();
        self.scc.prepare_read(&mut shared.scc, self.host, &word);
    }

    fn publish_metadata(&self, shared: &mut SharedRowState) {
        let word = shared.lock_word.raw().to_le_bytes();
        self.scc.finish_write(&mut shared.scc, self.host, &word);
    }

    // -------------------------------------------------------------------------
    // Tuples owned by this host
    // -------------------------------------------------------------------------

    fn lock_owned(&self, row: &LocalRow, mode: LockMode, read: bool) -> Option<(Tid, Bytes)> {
        let mut local = row.lock();
        let Some(handle) = local.migrated else {
            if read && !local.is_valid {
                return None;
            }
            let tid = take_lock(&mut local.lock_word, mode)?;
            let value = if read {
                Bytes::copy_from_slice(&local.data)
            } else {
                Bytes::new()
            };
            return Some((tid, value));
        };

        self.metrics.num_local_cxl_access.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.pool.resolve_row(handle).lock();
        let shared = &mut *guard;
        self.observe_metadata(shared);
        if read && !shared.is_valid {
            return None;
        }
        let tid = take_lock(&mut shared.lock_word, mode)?;
        self.publish_metadata(shared);
        if !read {
            return Some((tid, Bytes::new()));
        }
        // The local bytes double as a cache of the shared copy.
        if shared.modified_since_moved_in {
            self.scc
                .do_read(&mut shared.scc, self.host, &mut local.data, &shared.data);
            shared.modified_since_moved_in = false;
        }
        Some((tid, Bytes::copy_from_slice(&local.data)))
    }

    /// Locks a tuple of this host without reading it. Invalid tuples can be
    /// locked, which next-key locking relies on.
    pub fn lock(&self, row: &LocalRow, mode: LockMode) -> Option<Tid> {
        self.lock_owned(row, mode, false).map(|(tid, _)| tid)
    }

    /// Locks a valid tuple of this host and returns its version and bytes.
    pub fn take_lock_and_read(&self, row: &LocalRow, mode: LockMode) -> Option<(Tid, Bytes)> {
        self.lock_owned(row, mode, true)
    }

    /// Releases a lock on a tuple of this host. A write lock released with
    /// `commit_tid` installs it as the new version.
    pub fn release_lock(&self, row: &LocalRow, mode: LockMode, commit_tid: Option<Tid>) {
        let mut local = row.lock();
        match local.migrated {
            None => local.lock_word = release_lock_word(local.lock_word, mode, commit_tid),
            Some(handle) => {
                let mut guard = self.pool.resolve_row(handle).lock();
                let shared = &mut *guard;
                shared.lock_word = release_lock_word(shared.lock_word, mode, commit_tid);
                self.publish_metadata(shared);
            }
        }
    }

    /// Reads a tuple of a host-local table without locking it.
    pub fn read_local_index(&self, row: &LocalRow) -> Option<Bytes> {
        let mut local = row.lock();
        let Some(handle) = local.migrated else {
            return local.is_valid.then(|| Bytes::copy_from_slice(&local.data));
        };
        let mut guard = self.pool.resolve_row(handle).lock();
        let shared = &mut *guard;
        self.observe_metadata(shared);
        if !shared.is_valid {
            return None;
        }
        self.scc
            .do_read(&mut shared.scc, self.host, &mut local.data, &shared.data);
        shared.modified_since_moved_in = false;
        Some(Bytes::copy_from_slice(&local.data))
    }

    /// Overwrites a write-locked tuple of this host.
    pub fn update(&self, row: &LocalRow, value: &[u8]) {
        let mut local = row.lock();
        let Some(handle) = local.migrated else {
            local.write_data(value);
            return;
        };
        let mut guard = self.pool.resolve_row(handle).lock();
        let shared = &mut *guard;
        assert!(
            shared.lock_word.is_write_locked(),
            "update of {:?} without its write lock",
            shared.owner
        );
        self.scc
            .do_write(&mut shared.scc, self.host, &mut shared.data, value);
        local.data.copy_from_slice(value);
        shared.modified_since_moved_in = false;
    }

    /// Flips the validity bit of a write-locked tuple of this host.
    pub fn modify_tuple_valid_bit(&self, row: &LocalRow, valid: bool) {
        let mut local = row.lock();
        match local.migrated {
            None => local.is_valid = valid,
            Some(handle) => {
                let mut guard = self.pool.resolve_row(handle).lock();
                let shared = &mut *guard;
                shared.is_valid = valid;
                self.publish_metadata(shared);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Tuples owned by other hosts
    // -------------------------------------------------------------------------

    /// Resolves a key to a valid shared tuple, optionally pinning it.
    pub fn get_migrated_row(&self, key: &RegionKey, inc_ref_cnt: bool) -> Option<SharedHandle<SharedRow>> {
        self.index.get_migrated_row(&self.pool, key, inc_ref_cnt)
    }

    /// Gives back a reference count taken on a shared tuple.
    pub fn release_migrated_row(&self, handle: SharedHandle<SharedRow>) {
        self.pool.resolve_row(handle).lock().dec_ref_cnt();
        self.pool.note_ref_released();
    }

    /// Locks a valid shared tuple and reads it. With `inc_ref_cnt` a
    /// reference count is taken, only if the lock was granted.
    pub fn remote_take_lock_and_read(
        &self,
        handle: SharedHandle<SharedRow>,
        mode: LockMode,
        inc_ref_cnt: bool,
    ) -> Option<(Tid, Bytes)> {
        let mut guard = self.pool.resolve_row(handle).lock();
        let shared = &mut *guard;
        self.observe_metadata(shared);
        if !shared.is_valid {
            return None;
        }
        let tid = take_lock(&mut shared.lock_word, mode)?;
        if inc_ref_cnt {
            shared.inc_ref_cnt();
            self.pool.note_ref_acquired();
        }
        self.publish_metadata(shared);
        let mut buf = vec![0u8; shared.data.len()];
        self.scc.do_read(&mut shared.scc, self.host, &mut buf, &shared.data);
        self.metrics.num_remote_cxl_access.fetch_add(1, Ordering::Relaxed);
        Some((tid, Bytes::from(buf)))
    }

    /// Reads a shared tuple whose lock the owner already took on this
    /// host's behalf. Returns the version, the bytes and the
    /// `(prev_key_real, next_key_real)` bits.
    pub fn remote_read_locked(&self, handle: SharedHandle<SharedRow>) -> (Tid, Bytes, (bool, bool)) {
        let mut guard = self.pool.resolve_row(handle).lock();
        let shared = &mut *guard;
        self.observe_metadata(shared);
        assert!(
            shared.lock_word.is_read_locked() || shared.lock_word.is_write_locked(),
            "{:?} handed over without a lock",
            shared.owner
        );
        let mut buf = vec![0u8; shared.data.len()];
        self.scc.do_read(&mut shared.scc, self.host, &mut buf, &shared.data);
        self.metrics.num_remote_cxl_access.fetch_add(1, Ordering::Relaxed);
        (
            shared.tid(),
            Bytes::from(buf),
            (shared.prev_key_real, shared.next_key_real),
        )
    }

    /// Releases a lock on a shared tuple owned by another host.
    pub fn remote_release_lock(&self, handle: SharedHandle<SharedRow>, mode: LockMode, commit_tid: Option<Tid>) {
        let mut guard = self.pool.resolve_row(handle).lock();
        let shared = &mut *guard;
        shared.lock_word = release_lock_word(shared.lock_word, mode, commit_tid);
        self.publish_metadata(shared);
    }

    /// Overwrites a write-locked shared tuple owned by another host.
    pub fn remote_update(&self, handle: SharedHandle<SharedRow>, value: &[u8]) {
        let mut guard = self.pool.resolve_row(handle).lock();
        let shared = &mut *guard;
        assert!(
            shared.lock_word.is_write_locked(),
            "remote update of {:?} without its write lock",
            shared.owner
        );
        self.scc
            .do_write(&mut shared.scc, self.host, &mut shared.data, value);
        shared.modified_since_moved_in = true;
    }

    /// Flips the validity bit of a write-locked shared tuple.
    pub fn remote_modify_tuple_valid_bit(&self, handle: SharedHandle<SharedRow>, valid: bool) {
        let mut guard = self.pool.resolve_row(handle).lock();
        let shared = &mut *guard;
        shared.is_valid = valid;
        self.publish_metadata(shared);
    }

    // -------------------------------------------------------------------------
    // Replacement bookkeeping
    // -------------------------------------------------------------------------

    /// Stamps an access on a shared tuple.
    pub fn touch_migrated_row(&self, handle: SharedHandle<SharedRow>) {
        let stamp = self.pool.tick_access();
        let mut shared = self.pool.resolve_row(handle).lock();
        shared.last_access = stamp;
        shared.referenced = true;
    }

    /// Returns the last access stamp of a migrated tuple.
    pub fn last_access(&self, key: &RegionKey) -> Option<u64> {
        let handle = self.index.lookup(key)?;
        let last_access = self.pool.resolve_row(handle).lock().last_access;
        Some(last_access)
    }

    /// Clears and returns the reference bit of a migrated tuple.
    pub fn take_reference_bit(&self, key: &RegionKey) -> Option<bool> {
        let handle = self.index.lookup(key)?;
        let mut shared = self.pool.resolve_row(handle).lock();
        Some(std::mem::replace(&mut shared.referenced, false))
    }

    // -------------------------------------------------------------------------
    // Migration
    // -------------------------------------------------------------------------

    fn move_in_locked(
        &self,
        region_key: RegionKey,
        local: &mut LocalRowState,
        inc_ref_cnt: bool,
    ) -> MigrationResult {
        if let Some(handle) = local.migrated {
            if inc_ref_cnt {
                self.pool.resolve_row(handle).lock().inc_ref_cnt();
                self.pool.note_ref_acquired();
            }
            return MigrationResult::AlreadyInShared(handle);
        }

        let (handle, fresh) = match local.cached_shared.take() {
            Some(handle) => {
                if let Err(e) = self.pool.unpark_row(handle) {
                    debug!(%region_key, error = %e, "no room to reuse cached shared copy");
                    local.cached_shared = Some(handle);
                    return MigrationResult::OutOfMemory;
                }
                (handle, false)
            }
            None => match self.pool.malloc_row(region_key, local.data.len()) {
                Ok(handle) => (handle, true),
                Err(e) => {
                    debug!(%region_key, error = %e, "no room to migrate tuple");
                    return MigrationResult::OutOfMemory;
                }
            },
        };
        if let Err(e) = self.pool.charge(AllocCategory::Index, INDEX_ENTRY_BYTES) {
            debug!(%region_key, error = %e, "no room for index entry");
            if fresh {
                self.pool.free_row(handle);
            } else {
                self.pool.park_row(handle);
                local.cached_shared = Some(handle);
            }
            return MigrationResult::OutOfMemory;
        }

        {
            let mut guard = self.pool.resolve_row(handle).lock();
            let shared = &mut *guard;
            if !fresh {
                shared.reset_metadata();
            }
            self.scc.init_scc_metadata(&mut shared.scc, self.host);
            if fresh || local.modified_since_moved_out || !self.enable_migration_optimization {
                self.scc
                    .do_write(&mut shared.scc, self.host, &mut shared.data, &local.data);
            }
            shared.is_valid = local.is_valid;
            shared.lock_word = local.lock_word;
            if inc_ref_cnt {
                shared.inc_ref_cnt();
                self.pool.note_ref_acquired();
            }
            shared.last_access = self.pool.tick_access();
            shared.referenced = true;
            self.publish_metadata(shared);
        }
        local.modified_since_moved_out = false;
        local.migrated = Some(handle);
        let published = self.index.insert(region_key, handle);
        assert!(published, "{region_key} is already in the shared region");

        self.metrics.num_data_move_in.fetch_add(1, Ordering::Relaxed);
        trace!(%region_key, %handle, fresh, "moved tuple into the shared region");
        MigrationResult::Success(handle)
    }

    fn set_neighbour_bit(&self, entry: Option<&RowEntry>, next_side: bool, value: bool) -> bool {
        let Some(handle) = entry.and_then(|e| e.row.migrated()) else {
            return false;
        };
        let mut guard = self.pool.resolve_row(handle).lock();
        let shared = &mut *guard;
        if next_side {
            shared.next_key_real = value;
        } else {
            shared.prev_key_real = value;
        }
        self.publish_metadata(shared);
        true
    }

    /// Moves a tuple of this host into the shared region and publishes it
    /// in the index. Neighbours in key order that are already migrated get
    /// their real-key bits set. With `inc_ref_cnt` the caller receives a
    /// reference count, also when the tuple was already migrated.
    pub fn move_from_partition_to_shared_region(
        &self,
        table: &dyn Table,
        key: Key,
        inc_ref_cnt: bool,
    ) -> MigrationResult {
        let region_key = Self::region_key(table, key);
        let mut result = MigrationResult::NotFound;
        table.search_and_update_next_key_info(key, &mut |adj| {
            result = self.move_in_locked(region_key, &mut adj.cur.row.lock(), inc_ref_cnt);
            if let Some(handle) = result.handle() {
                let prev_real = self.set_neighbour_bit(adj.prev, true, true);
                let next_real = self.set_neighbour_bit(adj.next, false, true);
                let mut guard = self.pool.resolve_row(handle).lock();
                let shared = &mut *guard;
                shared.prev_key_real = prev_real;
                shared.next_key_real = next_real;
                self.publish_metadata(shared);
            }
            true
        });
        result
    }

    fn move_out_locked(&self, worker: WorkerId, region_key: RegionKey, local: &mut LocalRowState) -> MoveOutStatus {
        let Some(handle) = local.migrated else {
            return MoveOutStatus::NotMigrated;
        };
        {
            let mut guard = self.pool.resolve_row(handle).lock();
            let shared = &mut *guard;
            if shared.ref_cnt > 0 {
                return MoveOutStatus::Referenced;
            }
            self.observe_metadata(shared);
            if shared.modified_since_moved_in || !self.enable_migration_optimization {
                self.scc
                    .do_read(&mut shared.scc, self.host, &mut local.data, &shared.data);
            }
            local.lock_word = shared.lock_word;
            local.is_valid = shared.is_valid;
            shared.is_valid = false;
            shared.modified_since_moved_in = false;
            shared.prev_key_real = false;
            shared.next_key_real = false;
            self.publish_metadata(shared);
        }
        local.migrated = None;
        local.modified_since_moved_out = false;

        let removed = self.index.remove(&region_key, Some(handle));
        assert!(removed.is_some(), "{region_key} missing from the shared region");
        self.pool.credit(AllocCategory::Index, INDEX_ENTRY_BYTES);
        if self.enable_migration_optimization {
            self.pool.park_row(handle);
            local.cached_shared = Some(handle);
        } else {
            let size = SHARED_ROW_METADATA_BYTES + local.data.len() as u64;
            self.ebr
                .retire(worker, handle.to_raw(), size, AllocCategory::Metadata);
        }
        self.metrics.num_data_move_out.fetch_add(1, Ordering::Relaxed);
        trace!(%region_key, %handle, "moved tuple out of the shared region");
        MoveOutStatus::Moved
    }

    /// Moves a migrated tuple back to its partition. Refuses while any
    /// remote transaction holds a reference count on it. Lock state travels
    /// with the tuple, so owner-side locks stay valid.
    pub fn move_from_shared_region_to_partition(&self, worker: WorkerId, table: &dyn Table, key: Key) -> MoveOutStatus {
        let region_key = Self::region_key(table, key);
        let mut status = MoveOutStatus::NotFound;
        table.search_and_update_next_key_info(key, &mut |adj| {
            status = self.move_out_locked(worker, region_key, &mut adj.cur.row.lock());
            if status == MoveOutStatus::Moved {
                self.set_neighbour_bit(adj.prev, true, false);
                self.set_neighbour_bit(adj.next, false, false);
            }
            true
        });
        status
    }

    // -------------------------------------------------------------------------
    // Structural changes
    // -------------------------------------------------------------------------

    /// Inserts an invalid, write-locked placeholder for `key`. With next-key handling the
    /// successor is write-locked first and the insert refused if that
    /// fails. Returns the new row and the successor lock when `Hold` was
    /// asked for; None if the key exists or the gap is locked.
    pub fn insert_and_update_next_key_info(
        &self,
        table: &dyn Table,
        key: Key,
        value: &[u8],
        next_key: NextKeyLock,
    ) -> Option<(Arc<LocalRow>, Option<Arc<LocalRow>>)> {
        let mut held_next = None;
        let row = table.insert_and_process_adjacent_tuples(key, value, true, &mut |prev, next| {
            if let (Some(next), true) = (next, next_key != NextKeyLock::None) {
                if self.lock(&next.row, LockMode::Write).is_none() {
                    return false;
                }
                if next_key == NextKeyLock::Hold {
                    held_next = Some(Arc::clone(&next.row));
                } else {
                    self.release_lock(&next.row, LockMode::Write, None);
                }
            }
            // The new key starts local, so it breaks the run of migrated keys.
            self.set_neighbour_bit(prev, true, false);
            self.set_neighbour_bit(next, false, false);
            true
        })?;
        Some((row, held_next))
    }

    /// Removes `key` from its table, retiring its shared copies. Neighbours
    /// that become adjacent have their real-key bits recomputed. Returns
    /// None if the key is absent, otherwise whether the tuple was migrated.
    pub fn delete_and_update_next_key_info(
        &self,
        worker: WorkerId,
        table: &dyn Table,
        key: Key,
        is_local_delete: bool,
    ) -> Option<bool> {
        let region_key = Self::region_key(table, key);
        let mut was_migrated = false;
        let removed = table.remove_and_process_adjacent_tuples(key, &mut |adj| {
            {
                let mut local = adj.cur.row.lock();
                if let Some(handle) = local.migrated.take() {
                    {
                        let mut guard = self.pool.resolve_row(handle).lock();
                        let shared = &mut *guard;
                        if !is_local_delete && shared.is_valid {
                            warn!(%region_key, "remote delete of a valid tuple");
                        }
                        local.lock_word = shared.lock_word;
                        shared.is_valid = false;
                        self.publish_metadata(shared);
                    }
                    let removed = self.index.remove(&region_key, Some(handle));
                    assert!(removed.is_some(), "{region_key} missing from the shared region");
                    self.pool.credit(AllocCategory::Index, INDEX_ENTRY_BYTES);
                    let size = SHARED_ROW_METADATA_BYTES + local.data.len() as u64;
                    self.ebr
                        .retire(worker, handle.to_raw(), size, AllocCategory::Metadata);
                    was_migrated = true;
                }
                if let Some(handle) = local.cached_shared.take() {
                    self.ebr
                        .retire(worker, handle.to_raw(), local.data.len() as u64, AllocCategory::Data);
                }
                local.is_valid = false;
            }
            let prev_real = adj.prev.is_some_and(|e| e.row.migrated().is_some());
            let next_real = adj.next.is_some_and(|e| e.row.migrated().is_some());
            self.set_neighbour_bit(adj.prev, true, next_real);
            self.set_neighbour_bit(adj.next, false, prev_real);
            true
        });
        if !removed {
            return None;
        }
        debug!(%region_key, is_local_delete, was_migrated, "deleted tuple");
        Some(was_migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pasha_common::{PartitionId, SccMechanism, TableId};
    use pasha_cxl::{create_scc_manager, CxlPoolConfig};
    use pasha_storage::OrderedTable;

    const W: WorkerId = WorkerId(0);

    fn helper_with(optimization: bool) -> TwoPlPashaHelper {
        let pool = Arc::new(CxlPool::new(CxlPoolConfig {
            capacity_bytes: 1 << 20,
            row_slots: 64,
        }));
        let index = SharedIndex::create_and_publish(&pool, 16).unwrap();
        let ebr = Ebr::create_and_publish(&pool, 1, 1).unwrap();
        let config = PashaConfig {
            enable_migration_optimization: optimization,
            ..Default::default()
        };
        TwoPlPashaHelper::new(
            HostId(0),
            pool,
            index,
            create_scc_manager(SccMechanism::WriteThrough),
            ebr,
            &config,
        )
    }

    fn table_with(keys: &[u64]) -> OrderedTable {
        let table = OrderedTable::new(TableId(0), PartitionId(0), 8);
        for k in keys {
            table.insert(*k, &k.to_le_bytes(), false).unwrap();
        }
        table
    }

    fn shared_state(helper: &TwoPlPashaHelper, table: &dyn Table, key: Key) -> (bool, bool, bool) {
        let handle = helper.index().lookup(&TwoPlPashaHelper::region_key(table, key)).unwrap();
        let s = helper.pool().resolve_row(handle).lock();
        (s.is_valid, s.prev_key_real, s.next_key_real)
    }

    #[test]
    fn test_move_in_carries_value_and_version() {
        let helper = helper_with(true);
        let table = table_with(&[1]);
        let row = table.search(1).unwrap();
        row.lock().lock_word = LockWord::new(41);

        let handle = helper
            .move_from_partition_to_shared_region(&table, 1, false)
            .handle()
            .unwrap();
        assert_eq!(row.lock().migrated, Some(handle));

        let (tid, value) = helper.take_lock_and_read(&row, LockMode::Write).unwrap();
        assert_eq!(tid, 41);
        assert_eq!(&value[..], &1u64.to_le_bytes());
        assert!(!row.lock().lock_word.is_write_locked(), "lock lives in the shared copy");

        helper.update(&row, &7u64.to_le_bytes());
        helper.release_lock(&row, LockMode::Write, Some(42));
        assert_eq!(helper.stats().num_local_cxl_access, 1);

        assert_eq!(
            helper.move_from_shared_region_to_partition(W, &table, 1),
            MoveOutStatus::Moved
        );
        let local = row.lock();
        assert_eq!(local.tid(), 42);
        assert_eq!(&local.data[..], &7u64.to_le_bytes());
        assert!(local.cached_shared.is_some());
    }

    #[test]
    fn test_already_in_shared_adds_reference() {
        let helper = helper_with(true);
        let table = table_with(&[5]);
        let handle = helper
            .move_from_partition_to_shared_region(&table, 5, true)
            .handle()
            .unwrap();
        assert_eq!(
            helper.move_from_partition_to_shared_region(&table, 5, true),
            MigrationResult::AlreadyInShared(handle)
        );
        assert_eq!(helper.pool().resolve_row(handle).lock().ref_cnt, 2);
        assert_eq!(
            helper.move_from_partition_to_shared_region(&table, 99, false),
            MigrationResult::NotFound
        );
    }

    #[test]
    fn test_remote_write_refreshes_owner_copy() {
        let helper = helper_with(true);
        let table = table_with(&[3]);
        helper.move_from_partition_to_shared_region(&table, 3, false);
        let handle = helper.index().lookup(&TwoPlPashaHelper::region_key(&table, 3)).unwrap();

        let (_, value) = helper.remote_take_lock_and_read(handle, LockMode::Write, true).unwrap();
        assert_eq!(&value[..], &3u64.to_le_bytes());
        helper.remote_update(handle, &30u64.to_le_bytes());
        helper.remote_release_lock(handle, LockMode::Write, Some(9));
        helper.release_migrated_row(handle);

        let row = table.search(3).unwrap();
        let (tid, value) = helper.take_lock_and_read(&row, LockMode::Read).unwrap();
        assert_eq!(tid, 9);
        assert_eq!(&value[..], &30u64.to_le_bytes());
        assert!(!helper.pool().resolve_row(handle).lock().modified_since_moved_in);
        helper.release_lock(&row, LockMode::Read, None);
    }

    #[test]
    fn test_move_out_refused_while_referenced() {
        let helper = helper_with(false);
        let table = table_with(&[4]);
        helper.move_from_partition_to_shared_region(&table, 4, true);
        assert_eq!(
            helper.move_from_shared_region_to_partition(W, &table, 4),
            MoveOutStatus::Referenced
        );
        let handle = helper.index().lookup(&TwoPlPashaHelper::region_key(&table, 4)).unwrap();
        helper.release_migrated_row(handle);
        assert_eq!(
            helper.move_from_shared_region_to_partition(W, &table, 4),
            MoveOutStatus::Moved
        );
        assert_eq!(
            helper.move_from_shared_region_to_partition(W, &table, 4),
            MoveOutStatus::NotMigrated
        );
        assert_eq!(helper.ebr().pending(W), 1);
    }

    #[test]
    fn test_neighbour_bits_track_migrated_runs() {
        let helper = helper_with(true);
        let table = table_with(&[1, 2, 3]);
        helper.move_from_partition_to_shared_region(&table, 1, false);
        helper.move_from_partition_to_shared_region(&table, 3, false);
        assert_eq!(shared_state(&helper, &table, 1), (true, false, false));

        helper.move_from_partition_to_shared_region(&table, 2, false);
        assert_eq!(shared_state(&helper, &table, 1), (true, false, true));
        assert_eq!(shared_state(&helper, &table, 2), (true, true, true));
        assert_eq!(shared_state(&helper, &table, 3), (true, true, false));

        helper.move_from_shared_region_to_partition(W, &table, 2);
        assert_eq!(shared_state(&helper, &table, 1), (true, false, false));
        assert_eq!(shared_state(&helper, &table, 3), (true, false, false));
    }

    #[test]
    fn test_cached_copy_reused() {
        let helper = helper_with(true);
        let table = table_with(&[8]);
        let key = TwoPlPashaHelper::region_key(&table, 8);
        let baseline = helper.pool().hw_cc_usage();
        helper.move_from_partition_to_shared_region(&table, 8, false);
        let first = helper.index().lookup(&key).unwrap();
        helper.move_from_shared_region_to_partition(W, &table, 8);
        assert_eq!(helper.pool().hw_cc_usage(), baseline);
        assert!(helper.pool().is_row_live(first));

        helper.move_from_partition_to_shared_region(&table, 8, false);
        assert_eq!(helper.index().lookup(&key), Some(first));
        assert!(shared_state(&helper, &table, 8).0);
    }

    #[test]
    fn test_delete_retires_shared_copy() {
        let helper = helper_with(true);
        let table = table_with(&[1, 2, 3]);
        helper.move_from_partition_to_shared_region(&table, 1, false);
        helper.move_from_partition_to_shared_region(&table, 2, false);
        helper.move_from_partition_to_shared_region(&table, 3, false);

        assert_eq!(helper.delete_and_update_next_key_info(W, &table, 2, true), Some(true));
        assert_eq!(helper.delete_and_update_next_key_info(W, &table, 2, true), None);
        assert_eq!(shared_state(&helper, &table, 1), (true, false, true));
        assert_eq!(shared_state(&helper, &table, 3), (true, true, false));

        let pool = Arc::clone(helper.pool());
        helper.ebr().drain(W, |obj| pool.free_raw(obj.raw, obj.category));
        assert_eq!(pool.stats().rows_in_use, 2);
    }

    #[test]
    fn test_insert_holds_next_key() {
        let helper = helper_with(true);
        let table = table_with(&[10]);
        let (row, next) = helper
            .insert_and_update_next_key_info(&table, 5, &[0; 8], NextKeyLock::Hold)
            .unwrap();
        assert!(!row.lock().is_valid);
        assert!(row.lock().lock_word.is_write_locked());
        let next = next.unwrap();
        assert!(next.lock().lock_word.is_write_locked());

        assert!(helper
            .insert_and_update_next_key_info(&table, 7, &[0; 8], NextKeyLock::Probe)
            .is_none());
        helper.release_lock(&next, LockMode::Write, None);
        assert!(helper
            .insert_and_update_next_key_info(&table, 7, &[0; 8], NextKeyLock::Probe)
            .is_some());
        assert!(!next.lock().lock_word.is_write_locked());
    }

    #[test]
    fn test_invalid_tuple_not_readable() {
        let helper = helper_with(true);
        let table = table_with(&[]);
        let (row, _) = helper
            .insert_and_update_next_key_info(&table, 1, &[0; 8], NextKeyLock::None)
            .unwrap();
        assert!(helper.take_lock_and_read(&row, LockMode::Read).is_none());
        assert!(row.lock().lock_word.is_write_locked());
        helper.modify_tuple_valid_bit(&row, true);
        helper.release_lock(&row, LockMode::Write, Some(3));
        assert_eq!(helper.take_lock_and_read(&row, LockMode::Read).map(|(t, _)| t), Some(3));
    }
}
