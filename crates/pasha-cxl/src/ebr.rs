//! Epoch-based reclamation for shared-region memory.
//!
//! Remote hosts read shared tuples without holding anything that pins the
//! slot, so a tuple that moves out cannot be freed right away. Workers retire
//! it into the list of the global epoch current at retirement and free it
//! only once the global epoch is two ahead, by which point every worker has
//! entered a newer epoch.
//!
//! The global epoch and every worker's local epoch live in the pool so all
//! hosts see them. Retired lists are per worker and only touched by the
//! worker that owns them.

use crate::arena::SharedHandle;
use crate::pool::{AllocCategory, CxlPool, ROOT_EBR};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use pasha_common::{Result, WorkerId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Number of retired lists per worker.
pub const MAX_EPOCH: usize = 3;

/// An object whose memory waits for the grace period to pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetiredObject {
    /// Raw pool handle.
    pub raw: u64,
    /// Bytes reclaimed when freed.
    pub size: u64,
    /// Pool category of the allocation.
    pub category: AllocCategory,
    /// Global epoch at retirement.
    pub epoch: u64,
}

struct WorkerSlot {
    local_epoch: AtomicU64,
    retired: Mutex<[Vec<RetiredObject>; MAX_EPOCH]>,
}

/// Atomic counters for reclamation activity.
#[derive(Debug, Default)]
struct EbrMetrics {
    retired_total: AtomicU64,
    reclaimed_total: AtomicU64,
    retiring_bytes: AtomicU64,
    epoch_advances_total: AtomicU64,
}

/// Point-in-time view of reclamation activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EbrStats {
    pub global_epoch: u64,
    pub retired_total: u64,
    pub reclaimed_total: u64,
    /// Bytes retired but not yet freed.
    pub retiring_bytes: u64,
    pub epoch_advances_total: u64,
}

/// Cluster-wide epoch state.
pub struct Ebr {
    global_epoch: CachePadded<AtomicU64>,
    workers: Box<[CachePadded<WorkerSlot>]>,
    advance_threshold: usize,
    metrics: EbrMetrics,
}

impl Ebr {
    /// Creates epoch state for `num_workers` workers across the cluster.
    pub fn new(num_workers: usize, advance_threshold: usize) -> Self {
        assert!(num_workers > 0, "EBR needs at least one worker");
        assert!(advance_threshold > 0, "advance threshold must be positive");
        let workers = (0..num_workers)
            .map(|_| {
                CachePadded::new(WorkerSlot {
                    local_epoch: AtomicU64::new(0),
                    retired: Mutex::new(Default::default()),
                })
            })
            .collect();
        Self {
            global_epoch: CachePadded::new(AtomicU64::new(0)),
            workers,
            advance_threshold,
            metrics: EbrMetrics::default(),
        }
    }

    /// Allocates the epoch state in the pool and publishes it. Called by the leader.
    pub fn create_and_publish(pool: &CxlPool, num_workers: usize, advance_threshold: usize) -> Result<Arc<Ebr>> {
        let bytes = (num_workers as u64 + 1) * 128;
        let handle = pool.malloc_structure(Ebr::new(num_workers, advance_threshold), AllocCategory::Misc, bytes)?;
        pool.set_root(ROOT_EBR, handle.to_raw());
        info!(num_workers, advance_threshold, "published EBR metadata");
        pool.resolve_structure(handle)
    }

    /// Attaches to the epoch state published by the leader.
    pub fn attach(pool: &CxlPool, timeout: Duration) -> Result<Arc<Ebr>> {
        let raw = pool.wait_for_root(ROOT_EBR, timeout)?;
        pool.resolve_structure(SharedHandle::<Ebr>::from_raw(raw))
    }

    /// Returns the number of registered workers.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn global_epoch(&self) -> u64 {
        self.global_epoch.load(Ordering::Acquire)
    }

    pub fn local_epoch(&self, worker: WorkerId) -> u64 {
        self.slot(worker).local_epoch.load(Ordering::Acquire)
    }

    #[inline]
    fn slot(&self, worker: WorkerId) -> &WorkerSlot {
        match self.workers.get(worker.index()) {
            Some(slot) => slot,
            None => panic!("{worker} is not registered with EBR"),
        }
    }

    /// Retires an object into the current global epoch.
    ///
    /// A worker serving requests between critical sections may trail the
    /// global epoch by one, while others already pinned at the global epoch
    /// can hold the object.
    pub fn retire(&self, worker: WorkerId, raw: u64, size: u64, category: AllocCategory) {
        let slot = self.slot(worker);
        let epoch = self.global_epoch.load(Ordering::Acquire);
        slot.retired.lock()[epoch as usize % MAX_EPOCH].push(RetiredObject {
            raw,
            size,
            category,
            epoch,
        });
        self.metrics.retired_total.fetch_add(1, Ordering::Relaxed);
        self.metrics.retiring_bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Enters a critical section for `worker`.
    ///
    /// Tries to advance the global epoch when the worker's current list is
    /// long enough and every worker has caught up, brings the worker's local
    /// epoch up to the global one, and hands every object retired two epochs
    /// ago to `reclaim`. Must not be nested.
    pub fn enter_critical_section<F>(&self, worker: WorkerId, mut reclaim: F)
    where
        F: FnMut(&RetiredObject),
    {
        let slot = self.slot(worker);
        let local = slot.local_epoch.load(Ordering::Acquire);
        let mut global = self.global_epoch.load(Ordering::Acquire);
        debug_assert!(local <= global, "{worker} local epoch {local} ahead of global {global}");

        let mut retired = slot.retired.lock();

        if local == global && retired[local as usize % MAX_EPOCH].len() >= self.advance_threshold {
            let all_caught_up = self
                .workers
                .iter()
                .all(|w| w.local_epoch.load(Ordering::Acquire) == global);
            if all_caught_up
                && self
                    .global_epoch
                    .compare_exchange(global, global + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                self.metrics.epoch_advances_total.fetch_add(1, Ordering::Relaxed);
                debug!(%worker, epoch = global + 1, "advanced global epoch");
            }
            global = self.global_epoch.load(Ordering::Acquire);
        }

        if local < global {
            slot.local_epoch.store(global, Ordering::Release);
        }

        if global >= 2 {
            let list = &mut retired[(global - 2) as usize % MAX_EPOCH];
            if !list.is_empty() {
                let mut bytes = 0;
                for obj in list.iter() {
                    assert!(
                        obj.epoch + 2 <= global,
                        "reclaiming object from epoch {} at global epoch {global}",
                        obj.epoch
                    );
                    reclaim(obj);
                    bytes += obj.size;
                }
                self.metrics
                    .reclaimed_total
                    .fetch_add(list.len() as u64, Ordering::Relaxed);
                self.metrics.retiring_bytes.fetch_sub(bytes, Ordering::Relaxed);
                debug!(%worker, count = list.len(), epoch = global - 2, "reclaimed retired objects");
                list.clear();
            }
        }
    }

    /// Hands every object retired by `worker` to `reclaim` regardless of
    /// epoch. Only valid once no host can still read shared tuples.
    pub fn drain<F>(&self, worker: WorkerId, mut reclaim: F)
    where
        F: FnMut(&RetiredObject),
    {
        let mut retired = self.slot(worker).retired.lock();
        for list in retired.iter_mut() {
            for obj in list.drain(..) {
                reclaim(&obj);
                self.metrics.reclaimed_total.fetch_add(1, Ordering::Relaxed);
                self.metrics.retiring_bytes.fetch_sub(obj.size, Ordering::Relaxed);
            }
        }
    }

    /// Returns the number of objects a worker has retired but not freed.
    pub fn pending(&self, worker: WorkerId) -> usize {
        self.slot(worker).retired.lock().iter().map(Vec::len).sum()
    }

    /// Returns a statistics snapshot.
    pub fn stats(&self) -> EbrStats {
        EbrStats {
            global_epoch: self.global_epoch(),
            retired_total: self.metrics.retired_total.load(Ordering::Relaxed),
            reclaimed_total: self.metrics.reclaimed_total.load(Ordering::Relaxed),
            retiring_bytes: self.metrics.retiring_bytes.load(Ordering::Relaxed),
            epoch_advances_total: self.metrics.epoch_advances_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn retire_n(ebr: &Ebr, worker: WorkerId, n: usize, base: u64) {
        for i in 0..n {
            ebr.retire(worker, base + i as u64, 8, AllocCategory::Metadata);
        }
    }

    #[test]
    fn test_single_worker_lifecycle() {
        let ebr = Ebr::new(1, 2);
        let w = WorkerId(0);
        let mut freed = Vec::new();

        retire_n(&ebr, w, 2, 0);
        ebr.enter_critical_section(w, |o| freed.push(*o));
        assert_eq!(ebr.global_epoch(), 1);
        assert!(freed.is_empty());

        retire_n(&ebr, w, 2, 10);
        ebr.enter_critical_section(w, |o| freed.push(*o));
        assert_eq!(ebr.global_epoch(), 2);
        // Objects from epoch 0 are freed once the global epoch reaches 2.
        assert_eq!(freed.iter().map(|o| o.raw).collect::<Vec<_>>(), vec![0, 1]);
        assert!(freed.iter().all(|o| o.epoch == 0));

        let stats = ebr.stats();
        assert_eq!(stats.retired_total, 4);
        assert_eq!(stats.reclaimed_total, 2);
        assert_eq!(stats.retiring_bytes, 16);
        assert_eq!(stats.epoch_advances_total, 2);
        assert_eq!(ebr.pending(w), 2);
    }

    #[test]
    fn test_lagging_worker_blocks_advance() {
        let ebr = Ebr::new(2, 1);
        let (a, b) = (WorkerId(0), WorkerId(1));

        retire_n(&ebr, a, 1, 0);
        ebr.enter_critical_section(a, |_| {});
        assert_eq!(ebr.global_epoch(), 1);

        // b is still at epoch 0, so a cannot advance again.
        retire_n(&ebr, a, 1, 1);
        ebr.enter_critical_section(a, |_| panic!("nothing is old enough"));
        assert_eq!(ebr.global_epoch(), 1);

        ebr.enter_critical_section(b, |_| {});
        assert_eq!(ebr.local_epoch(b), 1);
        ebr.enter_critical_section(a, |_| {});
        assert_eq!(ebr.global_epoch(), 2);
    }

    #[test]
    fn test_retire_behind_global_waits_for_global() {
        let ebr = Ebr::new(2, 1);
        let (a, b) = (WorkerId(0), WorkerId(1));

        retire_n(&ebr, b, 1, 100);
        ebr.enter_critical_section(b, |_| {});
        assert_eq!(ebr.global_epoch(), 1);
        assert_eq!(ebr.local_epoch(a), 0);

        // a trails at 0 while b may already hold the object.
        ebr.retire(a, 7, 8, AllocCategory::Metadata);
        ebr.enter_critical_section(a, |_| panic!("nothing is old enough"));
        assert_eq!(ebr.local_epoch(a), 1);

        retire_n(&ebr, b, 1, 101);
        ebr.enter_critical_section(b, |o| assert_eq!(o.raw, 100));
        assert_eq!(ebr.global_epoch(), 2);
        // Freeing 7 now would race with b's epoch-1 critical section.
        ebr.enter_critical_section(a, |o| panic!("object {} freed one epoch early", o.raw));
        assert_eq!(ebr.pending(a), 1);

        retire_n(&ebr, b, 1, 102);
        ebr.enter_critical_section(b, |o| assert_eq!(o.raw, 101));
        assert_eq!(ebr.global_epoch(), 3);
        let mut freed = Vec::new();
        ebr.enter_critical_section(a, |o| freed.push(*o));
        assert_eq!(freed.len(), 1);
        assert_eq!((freed[0].raw, freed[0].epoch), (7, 1));
    }

    #[test]
    fn test_drain_frees_everything() {
        let ebr = Ebr::new(1, 1024);
        retire_n(&ebr, WorkerId(0), 5, 0);
        let mut freed = 0;
        ebr.drain(WorkerId(0), |_| freed += 1);
        assert_eq!(freed, 5);
        assert_eq!(ebr.pending(WorkerId(0)), 0);
        assert_eq!(ebr.stats().retiring_bytes, 0);
    }

    #[test]
    fn test_publish_and_attach() {
        let pool = CxlPool::new(crate::pool::CxlPoolConfig {
            capacity_bytes: 1 << 20,
            row_slots: 4,
        });
        let leader = Ebr::create_and_publish(&pool, 4, 16).unwrap();
        let follower = Ebr::attach(&pool, Duration::from_secs(1)).unwrap();
        assert!(Arc::ptr_eq(&leader, &follower));
        assert_eq!(follower.num_workers(), 4);
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn test_unknown_worker_panics() {
        Ebr::new(1, 1).retire(WorkerId(3), 0, 0, AllocCategory::Misc);
    }

    // Staggered workers: every free happens at least two epochs after the
    // retirement, and no worker is still behind the retirement epoch.
    #[test]
    fn test_staggered_workers_never_free_early() {
        const WORKERS: usize = 6;
        let ebr = Arc::new(Ebr::new(WORKERS, 4));
        let mut rng = rand::thread_rng();
        let mut next_raw = 0u64;
        let mut live = std::collections::HashSet::new();

        for _ in 0..5_000 {
            let w = WorkerId(rng.gen_range(0..WORKERS as u32));
            if rng.gen_bool(0.6) {
                ebr.retire(w, next_raw, 1, AllocCategory::Metadata);
                live.insert(next_raw);
                next_raw += 1;
            }
            let ebr_ref = &ebr;
            ebr.enter_critical_section(w, |obj| {
                let global = ebr_ref.global_epoch();
                assert!(obj.epoch + 2 <= global);
                for i in 0..WORKERS {
                    assert!(ebr_ref.local_epoch(WorkerId(i as u32)) > obj.epoch);
                }
                assert!(live.remove(&obj.raw), "object {} freed twice", obj.raw);
            });
        }

        assert!(ebr.stats().epoch_advances_total > 2);
        assert!(ebr.stats().reclaimed_total > 0);
    }
}
