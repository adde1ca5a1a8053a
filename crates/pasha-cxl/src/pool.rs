//! CXL memory pool.
//!
//! Models the shared memory every host maps: a slot arena for migrated
//! tuples, a table of cluster-wide structures (index, EBR metadata), and a
//! small array of well-known roots through which the leader publishes those
//! structures. Usage is accounted per allocation category against a byte
//! capacity.

use crate::arena::{SharedHandle, SlotArena};
use crate::index::RegionKey;
use crate::row::{SharedRow, SHARED_ROW_METADATA_BYTES};
use parking_lot::RwLock;
use pasha_common::{PashaError, Result};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::{debug, info};

/// Number of root slots.
pub const MAX_ROOTS: usize = 16;

/// Root holding the shared-region index.
pub const ROOT_SHARED_INDEX: usize = 0;

/// Root holding the EBR metadata.
pub const ROOT_EBR: usize = 1;

/// Root set once the leader finished initialization.
pub const ROOT_INIT_DONE: usize = 2;

const EMPTY_ROOT: u64 = u64::MAX;

/// Allocation categories tracked by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocCategory {
    /// Shared-region index buckets and entries.
    Index = 0,
    /// Shared tuple metadata.
    Metadata = 1,
    /// Shared tuple bytes.
    Data = 2,
    /// Message buffers.
    Transport = 3,
    /// Everything else (EBR metadata).
    Misc = 4,
}

impl AllocCategory {
    pub const ALL: [AllocCategory; 5] = [
        AllocCategory::Index,
        AllocCategory::Metadata,
        AllocCategory::Data,
        AllocCategory::Transport,
        AllocCategory::Misc,
    ];

    /// Returns true if allocations of this category need hardware coherence.
    pub fn is_hw_cc(self) -> bool {
        matches!(self, AllocCategory::Index | AllocCategory::Metadata)
    }
}

impl std::fmt::Display for AllocCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AllocCategory::Index => "index",
            AllocCategory::Metadata => "metadata",
            AllocCategory::Data => "data",
            AllocCategory::Transport => "transport",
            AllocCategory::Misc => "misc",
        };
        f.write_str(name)
    }
}

/// Configuration for the CXL pool.
#[derive(Debug, Clone)]
pub struct CxlPoolConfig {
    /// Capacity in bytes across all categories.
    pub capacity_bytes: u64,
    /// Number of shared tuple slots.
    pub row_slots: usize,
}

impl Default for CxlPoolConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 1024 * 1024 * 1024, // 1 GB
            row_slots: 1 << 16,
        }
    }
}

impl CxlPoolConfig {
    /// Sizes the pool to 25% of available system memory.
    ///
    /// Row slots are derived assuming one metadata block plus a cache line of
    /// data per tuple, with a floor of 1,024 slots.
    pub fn auto_sized() -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let capacity_bytes = (sys.available_memory() / 4).max(64 * 1024 * 1024);
        let per_row = SHARED_ROW_METADATA_BYTES * 2;
        let row_slots = ((capacity_bytes / per_row) as usize).clamp(1_024, u32::MAX as usize);

        Self {
            capacity_bytes,
            row_slots,
        }
    }
}

#[derive(Debug, Default)]
struct CategoryCounter {
    bytes: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
}

/// Usage snapshot of one category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryStats {
    pub bytes: u64,
    pub allocations: u64,
    pub frees: u64,
}

/// Statistics about the pool.
#[derive(Debug, Clone)]
pub struct CxlPoolStats {
    /// Capacity in bytes.
    pub capacity_bytes: u64,
    /// Bytes in use across categories.
    pub used_bytes: u64,
    /// Per-category usage, indexed by `AllocCategory as usize`.
    pub categories: [CategoryStats; 5],
    /// Occupied shared tuple slots.
    pub rows_in_use: usize,
    /// Shared tuple slot capacity.
    pub row_slots: usize,
    /// Reference counts taken on shared tuples.
    pub refs_acquired: u64,
    /// Reference counts released on shared tuples.
    pub refs_released: u64,
}

impl CxlPoolStats {
    /// Returns usage for one category.
    pub fn category(&self, category: AllocCategory) -> CategoryStats {
        self.categories[category as usize]
    }
}

struct Structure {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    bytes: u64,
    category: AllocCategory,
}

/// The CXL-addressable memory pool.
pub struct CxlPool {
    config: CxlPoolConfig,
    rows: SlotArena<SharedRow>,
    structures: RwLock<Vec<Option<Structure>>>,
    roots: Box<[AtomicU64]>,
    used_bytes: AtomicU64,
    categories: [CategoryCounter; 5],
    refs_acquired: AtomicU64,
    refs_released: AtomicU64,
    access_clock: AtomicU64,
}

impl CxlPool {
    /// Creates a pool.
    pub fn new(config: CxlPoolConfig) -> Self {
        info!(
            capacity_bytes = config.capacity_bytes,
            row_slots = config.row_slots,
            "initializing CXL pool"
        );
        let rows = SlotArena::new(config.row_slots, SharedRow::vacant);
        Self {
            config,
            rows,
            structures: RwLock::new(Vec::new()),
            roots: (0..MAX_ROOTS).map(|_| AtomicU64::new(EMPTY_ROOT)).collect(),
            used_bytes: AtomicU64::new(0),
            categories: Default::default(),
            refs_acquired: AtomicU64::new(0),
            refs_released: AtomicU64::new(0),
            access_clock: AtomicU64::new(0),
        }
    }

    /// Creates a pool sized from available system memory.
    pub fn auto_sized() -> Self {
        Self::new(CxlPoolConfig::auto_sized())
    }

    /// Returns the capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.config.capacity_bytes
    }

    /// Returns bytes in use.
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Returns bytes used by index and metadata allocations.
    pub fn hw_cc_usage(&self) -> u64 {
        AllocCategory::ALL
            .iter()
            .filter(|c| c.is_hw_cc())
            .map(|c| self.categories[*c as usize].bytes.load(Ordering::Acquire))
            .sum()
    }

    /// Reserves `bytes` under `category`, failing when the pool is full.
    pub fn charge(&self, category: AllocCategory, bytes: u64) -> Result<()> {
        let capacity = self.config.capacity_bytes;
        let mut current = self.used_bytes.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > capacity {
                return Err(PashaError::CxlOutOfMemory {
                    requested: bytes,
                    available: capacity - current,
                });
            }
            match self.used_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        let counter = &self.categories[category as usize];
        counter.bytes.fetch_add(bytes, Ordering::AcqRel);
        counter.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Returns `bytes` previously charged under `category`.
    pub fn credit(&self, category: AllocCategory, bytes: u64) {
        let counter = &self.categories[category as usize];
        let prev = counter.bytes.fetch_sub(bytes, Ordering::AcqRel);
        assert!(prev >= bytes, "{category} usage going negative");
        counter.frees.fetch_add(1, Ordering::Relaxed);
        self.used_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Allocates a shared tuple slot for `owner` with `value_size` bytes.
    ///
    /// The slot comes back initialized, invalid and unlocked.
    pub fn malloc_row(&self, owner: RegionKey, value_size: usize) -> Result<SharedHandle<SharedRow>> {
        self.charge(AllocCategory::Metadata, SHARED_ROW_METADATA_BYTES)?;
        if let Err(e) = self.charge(AllocCategory::Data, value_size as u64) {
            self.credit(AllocCategory::Metadata, SHARED_ROW_METADATA_BYTES);
            return Err(e);
        }
        let Some(handle) = self.rows.alloc() else {
            self.credit(AllocCategory::Data, value_size as u64);
            self.credit(AllocCategory::Metadata, SHARED_ROW_METADATA_BYTES);
            return Err(PashaError::CxlArenaExhausted {
                capacity: self.rows.capacity(),
            });
        };
        self.resolve_row(handle).lock().init(owner, value_size);
        Ok(handle)
    }

    /// Frees a shared tuple slot.
    pub fn free_row(&self, handle: SharedHandle<SharedRow>) {
        let freed = self.resolve_row(handle).lock().teardown();
        self.rows.free(handle);
        self.credit(AllocCategory::Data, freed as u64);
        self.credit(AllocCategory::Metadata, SHARED_ROW_METADATA_BYTES);
    }

    /// Resolves a tuple handle. Resolving a vacant slot is a logic error.
    #[inline]
    pub fn resolve_row(&self, handle: SharedHandle<SharedRow>) -> &SharedRow {
        match self.rows.get(handle) {
            Some(row) => row,
            None => panic!("{handle} does not refer to a live shared row"),
        }
    }

    /// Resolves a tuple handle, reporting vacant slots as errors.
    pub fn try_resolve_row(&self, handle: SharedHandle<SharedRow>) -> Result<&SharedRow> {
        self.rows
            .get(handle)
            .ok_or(PashaError::InvalidSharedHandle(handle.to_raw()))
    }

    /// Returns true if the tuple slot is occupied.
    pub fn is_row_live(&self, handle: SharedHandle<SharedRow>) -> bool {
        self.rows.is_occupied(handle)
    }

    /// Stops charging the metadata of a tuple that moved out but whose
    /// bytes stay cached in the pool.
    pub fn park_row(&self, handle: SharedHandle<SharedRow>) {
        debug_assert!(self.is_row_live(handle));
        self.credit(AllocCategory::Metadata, SHARED_ROW_METADATA_BYTES);
    }

    /// Charges the metadata of a cached tuple moving back in.
    pub fn unpark_row(&self, handle: SharedHandle<SharedRow>) -> Result<()> {
        debug_assert!(self.is_row_live(handle));
        self.charge(AllocCategory::Metadata, SHARED_ROW_METADATA_BYTES)
    }

    /// Frees a cached tuple whose metadata is no longer charged.
    pub fn free_parked_row(&self, handle: SharedHandle<SharedRow>) {
        let freed = self.resolve_row(handle).lock().teardown();
        self.rows.free(handle);
        self.credit(AllocCategory::Data, freed as u64);
    }

    /// Frees an object recorded by epoch-based reclamation.
    ///
    /// `Metadata` retires a live tuple, `Data` a parked cached copy.
    pub fn free_raw(&self, raw: u64, category: AllocCategory) {
        match category {
            AllocCategory::Metadata => self.free_row(SharedHandle::from_raw(raw)),
            AllocCategory::Data => self.free_parked_row(SharedHandle::from_raw(raw)),
            _ => self.free_structure_raw(raw),
        }
    }

    /// Advances the access clock, returning the new stamp.
    #[inline]
    pub fn tick_access(&self) -> u64 {
        self.access_clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Places a cluster-wide structure in the pool.
    pub fn malloc_structure<T: Any + Send + Sync>(
        &self,
        value: T,
        category: AllocCategory,
        bytes: u64,
    ) -> Result<SharedHandle<T>> {
        self.charge(category, bytes)?;
        let mut structures = self.structures.write();
        let slot = match structures.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                structures.push(None);
                structures.len() - 1
            }
        };
        structures[slot] = Some(Structure {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
            bytes,
            category,
        });
        debug!(slot, bytes, %category, type_name = std::any::type_name::<T>(), "allocated shared structure");
        Ok(SharedHandle::new(slot as u32))
    }

    /// Resolves a structure handle.
    pub fn resolve_structure<T: Any + Send + Sync>(&self, handle: SharedHandle<T>) -> Result<Arc<T>> {
        let structures = self.structures.read();
        let entry = structures
            .get(handle.slot() as usize)
            .and_then(Option::as_ref)
            .ok_or(PashaError::InvalidSharedHandle(handle.to_raw()))?;
        let type_name = entry.type_name;
        Arc::clone(&entry.value)
            .downcast::<T>()
            .map_err(|_| PashaError::RootTypeMismatch {
                index: handle.slot() as usize,
                expected: std::any::type_name::<T>(),
                actual: type_name,
            })
    }

    fn free_structure_raw(&self, raw: u64) {
        let removed = self
            .structures
            .write()
            .get_mut(raw as usize)
            .and_then(Option::take);
        match removed {
            Some(s) => self.credit(s.category, s.bytes),
            None => panic!("free of unknown shared structure {raw}"),
        }
    }

    /// Publishes a raw handle under a root index.
    pub fn set_root(&self, index: usize, raw: u64) {
        assert!(index < MAX_ROOTS, "root index {index} out of range");
        assert_ne!(raw, EMPTY_ROOT, "cannot publish the empty root marker");
        self.roots[index].store(raw, Ordering::Release);
    }

    /// Reads a root if it was published.
    pub fn get_root(&self, index: usize) -> Option<u64> {
        assert!(index < MAX_ROOTS, "root index {index} out of range");
        match self.roots[index].load(Ordering::Acquire) {
            EMPTY_ROOT => None,
            raw => Some(raw),
        }
    }

    /// Spins until the leader publishes a root.
    pub fn wait_for_root(&self, index: usize, timeout: Duration) -> Result<u64> {
        let start = Instant::now();
        loop {
            if let Some(raw) = self.get_root(index) {
                return Ok(raw);
            }
            if start.elapsed() >= timeout {
                return Err(PashaError::RootNotPublished { index });
            }
            std::thread::yield_now();
        }
    }

    /// Records a reference count taken on a shared tuple.
    #[inline]
    pub fn note_ref_acquired(&self) {
        self.refs_acquired.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a reference count released on a shared tuple.
    #[inline]
    pub fn note_ref_released(&self) {
        self.refs_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns statistics about the pool.
    pub fn stats(&self) -> CxlPoolStats {
        let categories = std::array::from_fn(|i| {
            let c = &self.categories[i];
            CategoryStats {
                bytes: c.bytes.load(Ordering::Acquire),
                allocations: c.allocations.load(Ordering::Relaxed),
                frees: c.frees.load(Ordering::Relaxed),
            }
        });
        CxlPoolStats {
            capacity_bytes: self.config.capacity_bytes,
            used_bytes: self.used_bytes(),
            categories,
            rows_in_use: self.rows.len(),
            row_slots: self.rows.capacity(),
            refs_acquired: self.refs_acquired.load(Ordering::Relaxed),
            refs_released: self.refs_released.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pasha_common::{PartitionId, TableId};

    fn create_test_pool(capacity_bytes: u64, row_slots: usize) -> CxlPool {
        CxlPool::new(CxlPoolConfig {
            capacity_bytes,
            row_slots,
        })
    }

    fn key(k: u64) -> RegionKey {
        RegionKey::new(TableId(1), PartitionId(0), k)
    }

    #[test]
    fn test_pool_new() {
        let pool = create_test_pool(4096, 8);
        let stats = pool.stats();
        assert_eq!(stats.capacity_bytes, 4096);
        assert_eq!(stats.used_bytes, 0);
        assert_eq!(stats.rows_in_use, 0);
        assert_eq!(stats.row_slots, 8);
    }

    #[test]
    fn test_malloc_row_accounts_categories() {
        let pool = create_test_pool(4096, 8);
        let h = pool.malloc_row(key(1), 100).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.category(AllocCategory::Metadata).bytes, SHARED_ROW_METADATA_BYTES);
        assert_eq!(stats.category(AllocCategory::Data).bytes, 100);
        assert_eq!(stats.used_bytes, SHARED_ROW_METADATA_BYTES + 100);
        assert_eq!(pool.hw_cc_usage(), SHARED_ROW_METADATA_BYTES);

        let row = pool.resolve_row(h).lock();
        assert_eq!(row.owner, Some(key(1)));
        assert_eq!(row.data.len(), 100);
    }

    #[test]
    fn test_free_row_returns_bytes() {
        let pool = create_test_pool(4096, 8);
        let h = pool.malloc_row(key(1), 100).unwrap();
        pool.free_row(h);

        let stats = pool.stats();
        assert_eq!(stats.used_bytes, 0);
        assert_eq!(stats.rows_in_use, 0);
        assert_eq!(stats.category(AllocCategory::Metadata).frees, 1);
        assert!(!pool.is_row_live(h));
        assert!(pool.try_resolve_row(h).is_err());
    }

    #[test]
    fn test_out_of_memory_rolls_back() {
        let pool = create_test_pool(SHARED_ROW_METADATA_BYTES + 50, 8);
        let result = pool.malloc_row(key(1), 100);
        assert!(matches!(result, Err(PashaError::CxlOutOfMemory { .. })));
        assert_eq!(pool.used_bytes(), 0);
    }

    #[test]
    fn test_arena_exhaustion_rolls_back() {
        let pool = create_test_pool(1 << 20, 1);
        pool.malloc_row(key(1), 8).unwrap();
        let result = pool.malloc_row(key(2), 8);
        assert!(matches!(result, Err(PashaError::CxlArenaExhausted { capacity: 1 })));
        assert_eq!(pool.used_bytes(), SHARED_ROW_METADATA_BYTES + 8);
    }

    #[test]
    #[should_panic(expected = "does not refer to a live shared row")]
    fn test_resolve_freed_row_panics() {
        let pool = create_test_pool(4096, 2);
        let h = pool.malloc_row(key(1), 8).unwrap();
        pool.free_row(h);
        pool.resolve_row(h);
    }

    #[test]
    fn test_roots_publish_and_wait() {
        let pool = Arc::new(create_test_pool(4096, 2));
        assert!(pool.get_root(ROOT_INIT_DONE).is_none());
        assert!(matches!(
            pool.wait_for_root(ROOT_INIT_DONE, Duration::from_millis(1)),
            Err(PashaError::RootNotPublished { index: ROOT_INIT_DONE })
        ));

        let leader = Arc::clone(&pool);
        let t = std::thread::spawn(move || leader.set_root(ROOT_INIT_DONE, 1));
        let raw = pool.wait_for_root(ROOT_INIT_DONE, Duration::from_secs(5)).unwrap();
        t.join().unwrap();
        assert_eq!(raw, 1);
    }

    #[test]
    fn test_structures_typed_resolution() {
        let pool = create_test_pool(4096, 2);
        let h = pool
            .malloc_structure(AtomicU64::new(11), AllocCategory::Misc, 64)
            .unwrap();
        pool.set_root(ROOT_EBR, h.to_raw());

        let raw = pool.get_root(ROOT_EBR).unwrap();
        let resolved = pool
            .resolve_structure(SharedHandle::<AtomicU64>::from_raw(raw))
            .unwrap();
        assert_eq!(resolved.load(Ordering::Relaxed), 11);

        let wrong = pool.resolve_structure(SharedHandle::<String>::from_raw(raw));
        assert!(matches!(wrong, Err(PashaError::RootTypeMismatch { .. })));

        pool.free_raw(raw, AllocCategory::Misc);
        assert_eq!(pool.used_bytes(), 0);
        assert!(pool.resolve_structure(SharedHandle::<AtomicU64>::from_raw(raw)).is_err());
    }

    #[test]
    fn test_parked_row_accounting() {
        let pool = create_test_pool(4096, 4);
        let h = pool.malloc_row(key(7), 32).unwrap();
        pool.park_row(h);
        assert_eq!(pool.hw_cc_usage(), 0);
        assert_eq!(pool.used_bytes(), 32);

        pool.unpark_row(h).unwrap();
        assert_eq!(pool.hw_cc_usage(), SHARED_ROW_METADATA_BYTES);
        pool.park_row(h);

        pool.free_raw(h.to_raw(), AllocCategory::Data);
        assert_eq!(pool.used_bytes(), 0);
        assert!(!pool.is_row_live(h));
    }

    #[test]
    fn test_unpark_fails_when_full() {
        let pool = create_test_pool(SHARED_ROW_METADATA_BYTES + 16, 4);
        let h = pool.malloc_row(key(1), 16).unwrap();
        pool.park_row(h);
        pool.charge(AllocCategory::Index, SHARED_ROW_METADATA_BYTES).unwrap();
        assert!(matches!(pool.unpark_row(h), Err(PashaError::CxlOutOfMemory { .. })));
    }

    #[test]
    fn test_access_clock_monotonic() {
        let pool = create_test_pool(4096, 2);
        let a = pool.tick_access();
        let b = pool.tick_access();
        assert!(b > a);
    }

    #[test]
    fn test_ref_stats() {
        let pool = create_test_pool(4096, 2);
        pool.note_ref_acquired();
        pool.note_ref_acquired();
        pool.note_ref_released();
        let stats = pool.stats();
        assert_eq!(stats.refs_acquired, 2);
        assert_eq!(stats.refs_released, 1);
    }

    #[test]
    fn test_auto_sized_floor() {
        let config = CxlPoolConfig::auto_sized();
        assert!(config.row_slots >= 1_024);
        assert!(config.capacity_bytes >= 64 * 1024 * 1024);
    }
}
