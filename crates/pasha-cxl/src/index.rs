//! Shared-region index.
//!
//! Maps (table, partition, plain key) to the shared tuple that currently
//! holds the authoritative copy. The leader allocates one index in the CXL
//! pool and publishes it through [`ROOT_SHARED_INDEX`]; every other host
//! attaches to the same structure.

use crate::arena::SharedHandle;
use crate::pool::{AllocCategory, CxlPool, ROOT_SHARED_INDEX};
use crate::row::SharedRow;
use parking_lot::Mutex;
use pasha_common::{PartitionId, Result, TableId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Bytes accounted per index entry.
pub const INDEX_ENTRY_BYTES: u64 = 32;

/// Bytes accounted per bucket header.
pub const INDEX_BUCKET_BYTES: u64 = 8;

/// Key of a migrated tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionKey {
    pub table: TableId,
    pub partition: PartitionId,
    pub plain_key: u64,
}

impl RegionKey {
    pub fn new(table: TableId, partition: PartitionId, plain_key: u64) -> Self {
        Self {
            table,
            partition,
            plain_key,
        }
    }

    #[inline]
    fn hash(&self) -> u64 {
        // FxHash-style multiply for distribution
        let mixed = self.plain_key
            ^ ((self.table.0 as u64) << 48)
            ^ ((self.partition.0 as u64) << 32).rotate_left(7);
        mixed.wrapping_mul(0x517cc1b727220a95)
    }
}

impl std::fmt::Display for RegionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.table, self.partition, self.plain_key)
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    key: RegionKey,
    row: SharedHandle<SharedRow>,
}

/// Fixed-bucket concurrent hash table of migrated tuples.
///
/// Each bucket has its own lock, so concurrent operations on different keys
/// only contend when they collide, and operations on the same key serialize.
pub struct SharedIndex {
    buckets: Box<[Mutex<Vec<IndexEntry>>]>,
    mask: usize,
    len: AtomicUsize,
}

impl SharedIndex {
    /// Creates an index with `bucket_count` buckets (power of two).
    pub fn new(bucket_count: usize) -> Self {
        assert!(
            bucket_count.is_power_of_two(),
            "bucket count {bucket_count} is not a power of two"
        );
        Self {
            buckets: (0..bucket_count).map(|_| Mutex::new(Vec::new())).collect(),
            mask: bucket_count - 1,
            len: AtomicUsize::new(0),
        }
    }

    /// Allocates the index in the pool and publishes it. Called by the leader.
    pub fn create_and_publish(pool: &CxlPool, bucket_count: usize) -> Result<Arc<SharedIndex>> {
        let bytes = bucket_count as u64 * INDEX_BUCKET_BYTES;
        let handle = pool.malloc_structure(SharedIndex::new(bucket_count), AllocCategory::Index, bytes)?;
        pool.set_root(ROOT_SHARED_INDEX, handle.to_raw());
        info!(bucket_count, "published shared-region index");
        pool.resolve_structure(handle)
    }

    /// Attaches to the index published by the leader.
    pub fn attach(pool: &CxlPool, timeout: Duration) -> Result<Arc<SharedIndex>> {
        let raw = pool.wait_for_root(ROOT_SHARED_INDEX, timeout)?;
        pool.resolve_structure(SharedHandle::<SharedIndex>::from_raw(raw))
    }

    #[inline]
    fn bucket(&self, key: &RegionKey) -> &Mutex<Vec<IndexEntry>> {
        &self.buckets[(key.hash() as usize) & self.mask]
    }

    /// Returns the number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Returns true if the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up the shared tuple for a key.
    pub fn lookup(&self, key: &RegionKey) -> Option<SharedHandle<SharedRow>> {
        self.bucket(key)
            .lock()
            .iter()
            .find(|e| e.key == *key)
            .map(|e| e.row)
    }

    /// Returns the existing entry for `key`, or inserts the handle built by
    /// `make`. The constructor runs under the bucket lock, so racing callers
    /// all observe the same handle. Returns `(handle, inserted)`.
    pub fn insert_if_absent<F>(&self, key: RegionKey, make: F) -> Result<(SharedHandle<SharedRow>, bool)>
    where
        F: FnOnce() -> Result<SharedHandle<SharedRow>>,
    {
        let mut bucket = self.bucket(&key).lock();
        if let Some(e) = bucket.iter().find(|e| e.key == key) {
            return Ok((e.row, false));
        }
        let row = make()?;
        bucket.push(IndexEntry { key, row });
        self.len.fetch_add(1, Ordering::AcqRel);
        Ok((row, true))
    }

    /// Inserts an entry, returning false if the key is already present.
    pub fn insert(&self, key: RegionKey, row: SharedHandle<SharedRow>) -> bool {
        let mut bucket = self.bucket(&key).lock();
        if bucket.iter().any(|e| e.key == key) {
            return false;
        }
        bucket.push(IndexEntry { key, row });
        self.len.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Removes the entry for `key`. When `expected` is given the entry is
    /// only removed if it still maps to that handle.
    pub fn remove(
        &self,
        key: &RegionKey,
        expected: Option<SharedHandle<SharedRow>>,
    ) -> Option<SharedHandle<SharedRow>> {
        let mut bucket = self.bucket(key).lock();
        let pos = bucket
            .iter()
            .position(|e| e.key == *key && expected.map_or(true, |h| h == e.row))?;
        let entry = bucket.swap_remove(pos);
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(entry.row)
    }

    /// Resolves a key to a valid shared tuple, optionally taking a reference
    /// count on it. Invalid tuples (placeholders, deleted rows) are reported
    /// as absent.
    pub fn get_migrated_row(
        &self,
        pool: &CxlPool,
        key: &RegionKey,
        inc_ref_cnt: bool,
    ) -> Option<SharedHandle<SharedRow>> {
        let handle = self.lookup(key)?;
        let mut row = pool.resolve_row(handle).lock();
        if !row.is_valid {
            return None;
        }
        if inc_ref_cnt {
            row.inc_ref_cnt();
            pool.note_ref_acquired();
        }
        Some(handle)
    }

    /// Calls `f` on every entry until it returns false.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&RegionKey, SharedHandle<SharedRow>) -> bool,
    {
        for bucket in self.buckets.iter() {
            let entries: Vec<IndexEntry> = bucket.lock().clone();
            for e in entries {
                if !f(&e.key, e.row) {
                    return;
                }
            }
        }
    }
}
