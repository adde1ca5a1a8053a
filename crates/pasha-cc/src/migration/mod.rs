//! Residency policies for the shared region.
//!
//! A host's migration manager tracks every tuple it has moved into the
//! shared region and decides which of them to move back out once the
//! host's share of the hardware-coherent budget is used up. Each tracked
//! tuple is charged its metadata and index entry.
//!
//! Victim ordering is pluggable through [`VictimOrder`]:
//! - [`EagerOrder`]: any unreferenced tuple, the whole partition at once
//! - [`FifoOrder`]: arrival order
//! - [`LruOrder`]: oldest shared-region access stamp first
//! - [`ClockOrder`]: second chance over the tuples' reference bits
//! - [`NeverEvict`]: nothing is ever moved out

mod clock;
mod eagerly;
mod fifo;
mod lru;
mod no_move_out;

pub use clock::ClockOrder;
pub use eagerly::EagerOrder;
pub use fifo::FifoOrder;
pub use lru::LruOrder;
pub use no_move_out::NeverEvict;

use crate::helper::TwoPlPashaHelper;
use parking_lot::Mutex;
use pasha_common::{Key, MigrationPolicyKind, MoveOutTiming, PartitionId, PashaConfig, WorkerId};
use pasha_cxl::{RegionKey, SharedHandle, SharedRow, INDEX_ENTRY_BYTES, SHARED_ROW_METADATA_BYTES};
use pasha_storage::Table;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Hardware-coherent bytes charged per migrated tuple.
pub const TRACKED_ROW_BYTES: u64 = SHARED_ROW_METADATA_BYTES + INDEX_ENTRY_BYTES;

/// Result of moving a tuple into the shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationResult {
    Success(SharedHandle<SharedRow>),
    AlreadyInShared(SharedHandle<SharedRow>),
    OutOfMemory,
    /// The key is no longer in its table.
    NotFound,
}

impl MigrationResult {
    /// Shared copy holding the tuple afterwards, if any.
    pub fn handle(self) -> Option<SharedHandle<SharedRow>> {
        match self {
            MigrationResult::Success(h) | MigrationResult::AlreadyInShared(h) => Some(h),
            MigrationResult::OutOfMemory | MigrationResult::NotFound => None,
        }
    }

    pub fn is_migrated(self) -> bool {
        self.handle().is_some()
    }
}

/// Result of trying to move one tuple back to its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutStatus {
    Moved,
    /// A remote transaction still holds a reference count.
    Referenced,
    NotMigrated,
    NotFound,
}

/// Work done by one move-out round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveOutOutcome {
    pub moved_rows: usize,
    pub freed_bytes: u64,
}

/// Point-in-time view of a migration manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationStats {
    pub policy: MigrationPolicyKind,
    pub tracked_rows: usize,
    pub used_bytes: u64,
    pub budget_bytes: u64,
    pub moved_in: u64,
    pub moved_out: u64,
    /// Victims skipped because they were still referenced.
    pub refused: u64,
}

/// A tuple this host has moved into the shared region.
#[derive(Clone)]
pub struct TrackedRow {
    pub region_key: RegionKey,
    pub table: Arc<dyn Table>,
    pub key: Key,
}

impl std::fmt::Debug for TrackedRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedRow")
            .field("region_key", &self.region_key)
            .field("key", &self.key)
            .finish()
    }
}

/// Order in which tracked tuples are offered for eviction.
pub trait VictimOrder: Send {
    fn track(&mut self, row: TrackedRow);

    /// Forgets a tuple. Returns false if it was not tracked.
    fn untrack(&mut self, key: &RegionKey) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Called once before the victims of a round are requested.
    fn begin_round(&mut self, _partition: PartitionId, _helper: &TwoPlPashaHelper) {}

    /// Returns the next tuple of `partition` to try, skipping `refused`.
    fn next_victim(
        &mut self,
        partition: PartitionId,
        helper: &TwoPlPashaHelper,
        refused: &HashSet<RegionKey>,
    ) -> Option<TrackedRow>;
}

/// Decides which migrated tuples stay in the shared region.
pub trait MigrationManager: Send + Sync {
    fn policy(&self) -> MigrationPolicyKind;

    fn when_to_move_out(&self) -> MoveOutTiming;

    /// Moves a tuple of this host into the shared region and tracks it.
    fn move_row_in(&self, table: &Arc<dyn Table>, key: Key, inc_ref_cnt: bool) -> MigrationResult;

    /// Moves tuples of `partition` back out while the host is over budget.
    fn move_row_out(&self, worker: WorkerId, partition: PartitionId) -> MoveOutOutcome;

    /// Deletes a tuple of this host, retiring its shared copies, and stops
    /// tracking it. Returns None if the key is absent, otherwise whether
    /// the tuple was migrated.
    fn delete_specific_row_and_move_out(
        &self,
        worker: WorkerId,
        table: &Arc<dyn Table>,
        key: Key,
        is_local_delete: bool,
    ) -> Option<bool>;

    /// Records an access to a migrated tuple.
    fn access_row(&self, _handle: SharedHandle<SharedRow>) {}

    fn tracked_rows(&self) -> usize;

    fn stats(&self) -> MigrationStats;
}

#[derive(Debug, Default)]
struct ManagerMetrics {
    moved_in: AtomicU64,
    moved_out: AtomicU64,
    refused: AtomicU64,
}

/// Migration manager driving a [`VictimOrder`].
pub struct PolicyManager<O> {
    kind: MigrationPolicyKind,
    timing: MoveOutTiming,
    helper: Arc<TwoPlPashaHelper>,
    budget: u64,
    /// Evict every unreferenced tuple of the partition once over budget.
    drain_partition: bool,
    /// Stamp accesses on shared tuples.
    stamp_accesses: bool,
    tracker: Mutex<O>,
    metrics: ManagerMetrics,
}

impl<O: VictimOrder> PolicyManager<O> {
    pub fn new(kind: MigrationPolicyKind, timing: MoveOutTiming, helper: Arc<TwoPlPashaHelper>, budget: u64, order: O) -> Self {
        Self {
            kind,
            timing,
            helper,
            budget,
            drain_partition: kind == MigrationPolicyKind::Eagerly,
            stamp_accesses: matches!(kind, MigrationPolicyKind::Lru | MigrationPolicyKind::Clock),
            tracker: Mutex::new(order),
            metrics: ManagerMetrics::default(),
        }
    }

    #[inline]
    fn used(order: &O) -> u64 {
        order.len() as u64 * TRACKED_ROW_BYTES
    }
}

impl<O: VictimOrder> MigrationManager for PolicyManager<O> {
    fn policy(&self) -> MigrationPolicyKind {
        self.kind
    }

    fn when_to_move_out(&self) -> MoveOutTiming {
        self.timing
    }

    fn move_row_in(&self, table: &Arc<dyn Table>, key: Key, inc_ref_cnt: bool) -> MigrationResult {
        let region_key = TwoPlPashaHelper::region_key(table.as_ref(), key);
        let mut tracker = self.tracker.lock();
        let result = self
            .helper
            .move_from_partition_to_shared_region(table.as_ref(), key, inc_ref_cnt);
        if let MigrationResult::Success(_) = result {
            tracker.track(TrackedRow {
                region_key,
                table: Arc::clone(table),
                key,
            });
            self.metrics.moved_in.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn move_row_out(&self, worker: WorkerId, partition: PartitionId) -> MoveOutOutcome {
        let mut outcome = MoveOutOutcome::default();
        let mut tracker = self.tracker.lock();
        if Self::used(&tracker) < self.budget {
            return outcome;
        }

        tracker.begin_round(partition, &self.helper);
        let mut refused = HashSet::new();
        while self.drain_partition || Self::used(&tracker) >= self.budget {
            let Some(victim) = tracker.next_victim(partition, &self.helper, &refused) else {
                break;
            };
            match self
                .helper
                .move_from_shared_region_to_partition(worker, victim.table.as_ref(), victim.key)
            {
                MoveOutStatus::Moved => {
                    tracker.untrack(&victim.region_key);
                    outcome.moved_rows += 1;
                    outcome.freed_bytes += TRACKED_ROW_BYTES;
                }
                MoveOutStatus::Referenced => {
                    refused.insert(victim.region_key);
                }
                MoveOutStatus::NotMigrated | MoveOutStatus::NotFound => {
                    tracker.untrack(&victim.region_key);
                }
            }
        }

        self.metrics
            .moved_out
            .fetch_add(outcome.moved_rows as u64, Ordering::Relaxed);
        self.metrics
            .refused
            .fetch_add(refused.len() as u64, Ordering::Relaxed);
        if outcome.moved_rows > 0 || !refused.is_empty() {
            debug!(
                %partition,
                moved = outcome.moved_rows,
                refused = refused.len(),
                tracked = tracker.len(),
                "move-out round"
            );
        }
        outcome
    }

    fn delete_specific_row_and_move_out(
        &self,
        worker: WorkerId,
        table: &Arc<dyn Table>,
        key: Key,
        is_local_delete: bool,
    ) -> Option<bool> {
        let region_key = TwoPlPashaHelper::region_key(table.as_ref(), key);
        let mut tracker = self.tracker.lock();
        let deleted = self
            .helper
            .delete_and_update_next_key_info(worker, table.as_ref(), key, is_local_delete);
        tracker.untrack(&region_key);
        deleted
    }

    fn access_row(&self, handle: SharedHandle<SharedRow>) {
        if self.stamp_accesses {
            self.helper.touch_migrated_row(handle);
        }
    }

    fn tracked_rows(&self) -> usize {
        self.tracker.lock().len()
    }

    fn stats(&self) -> MigrationStats {
        let tracker = self.tracker.lock();
        MigrationStats {
            policy: self.kind,
            tracked_rows: tracker.len(),
            used_bytes: Self::used(&tracker),
            budget_bytes: self.budget,
            moved_in: self.metrics.moved_in.load(Ordering::Relaxed),
            moved_out: self.metrics.moved_out.load(Ordering::Relaxed),
            refused: self.metrics.refused.load(Ordering::Relaxed),
        }
    }
}

/// Creates the migration manager configured for a host.
pub fn create_migration_manager(
    config: &PashaConfig,
    helper: Arc<TwoPlPashaHelper>,
    budget: u64,
) -> Arc<dyn MigrationManager> {
    let kind = config.migration_policy;
    let timing = config.when_to_move_out;
    info!(host = %helper.host(), policy = %kind, %timing, budget, "migration manager ready");
    match kind {
        MigrationPolicyKind::Eagerly => Arc::new(PolicyManager::new(kind, timing, helper, budget, EagerOrder::default())),
        MigrationPolicyKind::OnDemandFifo => Arc::new(PolicyManager::new(kind, timing, helper, budget, FifoOrder::default())),
        MigrationPolicyKind::Lru => Arc::new(PolicyManager::new(kind, timing, helper, budget, LruOrder::default())),
        MigrationPolicyKind::Clock => Arc::new(PolicyManager::new(kind, timing, helper, budget, ClockOrder::default())),
        MigrationPolicyKind::NoMoveOut => Arc::new(PolicyManager::new(kind, timing, helper, budget, NeverEvict::default())),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use pasha_common::{HostId, TableId};
    use pasha_cxl::{create_scc_manager, CxlPool, CxlPoolConfig, Ebr, SharedIndex};
    use pasha_storage::OrderedTable;

    pub fn helper() -> Arc<TwoPlPashaHelper> {
        let pool = Arc::new(CxlPool::new(CxlPoolConfig {
            capacity_bytes: 1 << 20,
            row_slots: 256,
        }));
        let index = SharedIndex::create_and_publish(&pool, 64).unwrap();
        let ebr = Ebr::create_and_publish(&pool, 1, 1).unwrap();
        Arc::new(TwoPlPashaHelper::new(
            HostId(0),
            pool,
            index,
            create_scc_manager(pasha_common::SccMechanism::NoOp),
            ebr,
            &PashaConfig::default(),
        ))
    }

    pub fn table(partition: u32, keys: impl IntoIterator<Item = u64>) -> Arc<dyn Table> {
        let table = OrderedTable::new(TableId(0), PartitionId(partition), 8);
        for k in keys {
            table.insert(k, &k.to_le_bytes(), false).unwrap();
        }
        Arc::new(table)
    }

    /// Moves `keys` in through the helper and returns their tracking records.
    pub fn migrate(helper: &TwoPlPashaHelper, table: &Arc<dyn Table>, keys: &[u64]) -> Vec<TrackedRow> {
        keys.iter()
            .map(|k| {
                assert!(helper
                    .move_from_partition_to_shared_region(table.as_ref(), *k, false)
                    .is_migrated());
                TrackedRow {
                    region_key: TwoPlPashaHelper::region_key(table.as_ref(), *k),
                    table: Arc::clone(table),
                    key: *k,
                }
            })
            .collect()
    }

    /// Drains every victim `order` offers for `partition`, untracking each.
    pub fn drain_order<O: VictimOrder>(order: &mut O, helper: &TwoPlPashaHelper, partition: PartitionId) -> Vec<u64> {
        order.begin_round(partition, helper);
        let refused = HashSet::new();
        let mut keys = Vec::new();
        while let Some(victim) = order.next_victim(partition, helper, &refused) {
            assert!(order.untrack(&victim.region_key));
            keys.push(victim.key);
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    const W: WorkerId = WorkerId(0);

    fn manager(kind: MigrationPolicyKind, rows: u64) -> (Arc<TwoPlPashaHelper>, Arc<dyn MigrationManager>) {
        let helper = helper();
        let config = PashaConfig {
            migration_policy: kind,
            ..Default::default()
        };
        let manager = create_migration_manager(&config, Arc::clone(&helper), rows * TRACKED_ROW_BYTES);
        (helper, manager)
    }

    #[test]
    fn test_under_budget_keeps_everything() {
        let (_, manager) = manager(MigrationPolicyKind::OnDemandFifo, 10);
        let table = table(0, 0..5);
        for k in 0..5 {
            assert!(matches!(manager.move_row_in(&table, k, false), MigrationResult::Success(_)));
        }
        assert_eq!(manager.move_row_out(W, PartitionId(0)), MoveOutOutcome::default());
        assert_eq!(manager.tracked_rows(), 5);
    }

    #[test]
    fn test_fifo_evicts_down_to_budget() {
        let (helper, manager) = manager(MigrationPolicyKind::OnDemandFifo, 4);
        let table = table(0, 0..6);
        for k in 0..6 {
            manager.move_row_in(&table, k, false);
        }
        let outcome = manager.move_row_out(W, PartitionId(0));
        assert_eq!(outcome.moved_rows, 3);
        assert_eq!(outcome.freed_bytes, 3 * TRACKED_ROW_BYTES);
        assert_eq!(manager.tracked_rows(), 3);
        for k in 0..3 {
            assert!(!table.search(k).unwrap().lock().is_migrated());
        }
        assert!(helper.index().lookup(&TwoPlPashaHelper::region_key(table.as_ref(), 5)).is_some());
    }

    #[test]
    fn test_eagerly_drains_partition_but_not_others() {
        let (_, manager) = manager(MigrationPolicyKind::Eagerly, 2);
        let p0 = table(0, 0..3);
        let p1 = table(1, 0..2);
        for k in 0..3 {
            manager.move_row_in(&p0, k, false);
        }
        for k in 0..2 {
            manager.move_row_in(&p1, k, false);
        }
        let outcome = manager.move_row_out(W, PartitionId(0));
        assert_eq!(outcome.moved_rows, 3);
        assert_eq!(manager.tracked_rows(), 2);
    }

    #[test]
    fn test_referenced_rows_survive_move_out() {
        let (_, manager) = manager(MigrationPolicyKind::Eagerly, 1);
        let table = table(0, 0..3);
        manager.move_row_in(&table, 0, true);
        manager.move_row_in(&table, 1, false);
        manager.move_row_in(&table, 2, false);

        let outcome = manager.move_row_out(W, PartitionId(0));
        assert_eq!(outcome.moved_rows, 2);
        assert!(table.search(0).unwrap().lock().is_migrated());
        assert_eq!(manager.stats().refused, 1);
    }

    #[test]
    fn test_no_move_out_keeps_rows_until_deleted() {
        let (_, manager) = manager(MigrationPolicyKind::NoMoveOut, 1);
        let table = table(0, 0..3);
        for k in 0..3 {
            manager.move_row_in(&table, k, false);
        }
        assert_eq!(manager.move_row_out(W, PartitionId(0)).moved_rows, 0);
        assert_eq!(manager.delete_specific_row_and_move_out(W, &table, 1, true), Some(true));
        assert_eq!(manager.delete_specific_row_and_move_out(W, &table, 1, true), None);
        assert_eq!(manager.tracked_rows(), 2);
    }

    #[test]
    fn test_second_move_in_is_not_tracked_twice() {
        let (_, manager) = manager(MigrationPolicyKind::Lru, 8);
        let table = table(0, [7]);
        let first = manager.move_row_in(&table, 7, false);
        assert!(matches!(first, MigrationResult::Success(_)));
        assert_eq!(
            manager.move_row_in(&table, 7, false),
            MigrationResult::AlreadyInShared(first.handle().unwrap())
        );
        assert_eq!(manager.move_row_in(&table, 8, false), MigrationResult::NotFound);
        let stats = manager.stats();
        assert_eq!(stats.tracked_rows, 1);
        assert_eq!(stats.used_bytes, TRACKED_ROW_BYTES);
    }
}
