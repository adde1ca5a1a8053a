//! Software cache coherence for shared tuple bytes.
//!
//! Hosts cache CXL memory without hardware coherence, so every byte-level
//! access to a migrated tuple goes through an [`SccManager`]. All calls must
//! happen while the tuple's latch is held; the latch orders the flushes.

use pasha_common::{HostId, SccMechanism};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cache line size used when walking a byte range.
pub const CACHE_LINE_SIZE: usize = 64;

/// Per-tuple coherence metadata: one "cache is current" bit per host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SccMeta(u32);

impl SccMeta {
    /// Maximum number of hosts tracked.
    pub const MAX_HOSTS: u32 = u32::BITS;

    #[inline]
    pub fn is_set(self, host: HostId) -> bool {
        self.0 & Self::bit(host) != 0
    }

    #[inline]
    pub fn set(&mut self, host: HostId) {
        self.0 |= Self::bit(host);
    }

    #[inline]
    pub fn clear_all(&mut self) {
        self.0 = 0;
    }

    /// Returns the raw bitmap.
    pub fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    fn bit(host: HostId) -> u32 {
        assert!(host.0 < Self::MAX_HOSTS, "{host} has no coherence bit");
        1 << host.0
    }
}

/// Snapshot of coherence statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SccStats {
    pub num_clflush: u64,
    pub num_clwb: u64,
    pub num_cache_hit: u64,
    pub num_cache_miss: u64,
}

impl SccStats {
    /// Fraction of reads served without a flush, None before any read.
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.num_cache_hit + self.num_cache_miss;
        if total == 0 {
            return None;
        }
        Some(self.num_cache_hit as f64 / total as f64)
    }
}

#[derive(Debug, Default)]
struct SccCounters {
    num_clflush: AtomicU64,
    num_clwb: AtomicU64,
    num_cache_hit: AtomicU64,
    num_cache_miss: AtomicU64,
}

impl SccCounters {
    fn snapshot(&self) -> SccStats {
        SccStats {
            num_clflush: self.num_clflush.load(Ordering::Relaxed),
            num_clwb: self.num_clwb.load(Ordering::Relaxed),
            num_cache_hit: self.num_cache_hit.load(Ordering::Relaxed),
            num_cache_miss: self.num_cache_miss.load(Ordering::Relaxed),
        }
    }

    fn clflush(&self, bytes: &[u8]) {
        self.num_clflush.fetch_add(1, Ordering::Relaxed);
        flush_range(bytes);
    }

    fn clwb(&self, bytes: &[u8]) {
        self.num_clwb.fetch_add(1, Ordering::Relaxed);
        flush_range(bytes);
    }
}

/// Coherence discipline applied around shared tuple accesses.
pub trait SccManager: Send + Sync {
    /// Returns which discipline this manager implements.
    fn mechanism(&self) -> SccMechanism;

    /// Initializes metadata of a freshly migrated tuple written by `host`.
    fn init_scc_metadata(&self, meta: &mut SccMeta, host: HostId);

    /// Makes the tuple's metadata region current before `host` inspects it.
    fn prepare_read(&self, meta: &mut SccMeta, host: HostId, region: &[u8]);

    /// Copies shared bytes into a host-private buffer.
    fn do_read(&self, meta: &mut SccMeta, host: HostId, dst: &mut [u8], src: &[u8]);

    /// Copies host-private bytes into the shared tuple.
    fn do_write(&self, meta: &mut SccMeta, host: HostId, dst: &mut [u8], src: &[u8]);

    /// Publishes a metadata update made by `host`.
    fn finish_write(&self, meta: &mut SccMeta, host: HostId, region: &[u8]);

    /// Returns a statistics snapshot.
    fn stats(&self) -> SccStats;
}

/// Creates the coherence manager for a mechanism.
pub fn create_scc_manager(mechanism: SccMechanism) -> Arc<dyn SccManager> {
    match mechanism {
        SccMechanism::NoOp => Arc::new(SccNoOp::default()),
        SccMechanism::NonTemporal => Arc::new(SccNonTemporal::default()),
        SccMechanism::WriteThrough => Arc::new(SccWriteThrough::default()),
    }
}

/// Plain copies for coherent fabrics.
#[derive(Debug, Default)]
pub struct SccNoOp {
    counters: SccCounters,
}

impl SccManager for SccNoOp {
    fn mechanism(&self) -> SccMechanism {
        SccMechanism::NoOp
    }

    fn init_scc_metadata(&self, meta: &mut SccMeta, host: HostId) {
        meta.clear_all();
        meta.set(host);
    }

    fn prepare_read(&self, _meta: &mut SccMeta, _host: HostId, _region: &[u8]) {}

    fn do_read(&self, _meta: &mut SccMeta, _host: HostId, dst: &mut [u8], src: &[u8]) {
        dst.copy_from_slice(src);
        self.counters.num_cache_hit.fetch_add(1, Ordering::Relaxed);
    }

    fn do_write(&self, _meta: &mut SccMeta, _host: HostId, dst: &mut [u8], src: &[u8]) {
        dst.copy_from_slice(src);
    }

    fn finish_write(&self, _meta: &mut SccMeta, _host: HostId, _region: &[u8]) {}

    fn stats(&self) -> SccStats {
        self.counters.snapshot()
    }
}

/// Flush before every read, write back after every write.
#[derive(Debug, Default)]
pub struct SccNonTemporal {
    counters: SccCounters,
}

impl SccManager for SccNonTemporal {
    fn mechanism(&self) -> SccMechanism {
        SccMechanism::NonTemporal
    }

    fn init_scc_metadata(&self, meta: &mut SccMeta, _host: HostId) {
        meta.clear_all();
    }

    fn prepare_read(&self, _meta: &mut SccMeta, _host: HostId, region: &[u8]) {
        self.counters.clflush(region);
    }

    fn do_read(&self, _meta: &mut SccMeta, _host: HostId, dst: &mut [u8], src: &[u8]) {
        self.counters.clflush(src);
        self.counters.num_cache_miss.fetch_add(1, Ordering::Relaxed);
        dst.copy_from_slice(src);
    }

    fn do_write(&self, _meta: &mut SccMeta, _host: HostId, dst: &mut [u8], src: &[u8]) {
        dst.copy_from_slice(src);
        self.counters.clwb(dst);
    }

    fn finish_write(&self, _meta: &mut SccMeta, _host: HostId, region: &[u8]) {
        self.counters.clwb(region);
    }

    fn stats(&self) -> SccStats {
        self.counters.snapshot()
    }
}

/// Per-host bitmap: a read flushes only when this host's bit is clear,
/// a write leaves only the writer's bit set.
#[derive(Debug, Default)]
pub struct SccWriteThrough {
    counters: SccCounters,
}

impl SccManager for SccWriteThrough {
    fn mechanism(&self) -> SccMechanism {
        SccMechanism::WriteThrough
    }

    fn init_scc_metadata(&self, meta: &mut SccMeta, host: HostId) {
        meta.clear_all();
        meta.set(host);
    }

    fn prepare_read(&self, meta: &mut SccMeta, host: HostId, region: &[u8]) {
        if !meta.is_set(host) {
            self.counters.clflush(region);
        }
    }

    fn do_read(&self, meta: &mut SccMeta, host: HostId, dst: &mut [u8], src: &[u8]) {
        if meta.is_set(host) {
            self.counters.num_cache_hit.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.clflush(src);
            meta.set(host);
            self.counters.num_cache_miss.fetch_add(1, Ordering::Relaxed);
        }
        dst.copy_from_slice(src);
    }

    fn do_write(&self, meta: &mut SccMeta, host: HostId, dst: &mut [u8], src: &[u8]) {
        // Writers always read under the same lock first.
        assert!(
            meta.is_set(host),
            "{host} writes a tuple its cache does not hold"
        );
        meta.clear_all();
        meta.set(host);
        dst.copy_from_slice(src);
        self.counters.clwb(dst);
    }

    fn finish_write(&self, _meta: &mut SccMeta, _host: HostId, region: &[u8]) {
        self.counters.clwb(region);
    }

    fn stats(&self) -> SccStats {
        self.counters.snapshot()
    }
}

/// Flushes every cache line covering `bytes`, then fences.
#[cfg(target_arch = "x86_64")]
fn flush_range(bytes: &[u8]) {
    use core::arch::x86_64::{_mm_clflush, _mm_sfence};

    if bytes.is_empty() {
        return;
    }
    let start = bytes.as_ptr() as usize & !(CACHE_LINE_SIZE - 1);
    let end = bytes.as_ptr() as usize + bytes.len();
    let mut line = start;
    while line < end {
        // SAFETY: clflush on an address inside a live cache line is a
        // hint with no memory effects; SSE2 is baseline on x86_64.
        unsafe { _mm_clflush(line as *const u8) };
        line += CACHE_LINE_SIZE;
    }
    // SAFETY: sfence has no preconditions.
    unsafe { _mm_sfence() };
}

#[cfg(not(target_arch = "x86_64"))]
fn flush_range(_bytes: &[u8]) {
    std::sync::atomic::fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scc_meta_bits() {
        let mut meta = SccMeta::default();
        assert!(!meta.is_set(HostId(3)));
        meta.set(HostId(3));
        meta.set(HostId(0));
        assert!(meta.is_set(HostId(3)));
        assert_eq!(meta.bits(), 0b1001);
        meta.clear_all();
        assert_eq!(meta.bits(), 0);
    }

    #[test]
    fn test_noop_copies() {
        let scc = SccNoOp::default();
        let mut meta = SccMeta::default();
        let mut shared = vec![0u8; 8];
        scc.do_write(&mut meta, HostId(0), &mut shared, b"abcdefgh");
        let mut out = vec![0u8; 8];
        scc.do_read(&mut meta, HostId(1), &mut out, &shared);
        assert_eq!(&out, b"abcdefgh");
        assert_eq!(scc.stats().num_clflush, 0);
        assert_eq!(scc.stats().num_clwb, 0);
    }

    #[test]
    fn test_non_temporal_always_flushes() {
        let scc = SccNonTemporal::default();
        let mut meta = SccMeta::default();
        scc.init_scc_metadata(&mut meta, HostId(0));
        let mut shared = vec![0u8; 100];
        scc.do_write(&mut meta, HostId(0), &mut shared, &[7u8; 100]);
        let mut out = vec![0u8; 100];
        scc.do_read(&mut meta, HostId(0), &mut out, &shared);
        scc.do_read(&mut meta, HostId(0), &mut out, &shared);
        let stats = scc.stats();
        assert_eq!(stats.num_clwb, 1);
        assert_eq!(stats.num_clflush, 2);
        assert_eq!(stats.num_cache_miss, 2);
        assert_eq!(out, vec![7u8; 100]);
    }

    #[test]
    fn test_write_through_hits_after_first_read() {
        let scc = SccWriteThrough::default();
        let mut meta = SccMeta::default();
        scc.init_scc_metadata(&mut meta, HostId(0));
        let shared = vec![1u8; 16];
        let mut out = vec![0u8; 16];

        // Owner wrote it, so the owner hits.
        scc.do_read(&mut meta, HostId(0), &mut out, &shared);
        // Host 1 misses once, then hits.
        scc.do_read(&mut meta, HostId(1), &mut out, &shared);
        scc.do_read(&mut meta, HostId(1), &mut out, &shared);

        let stats = scc.stats();
        assert_eq!(stats.num_cache_hit, 2);
        assert_eq!(stats.num_cache_miss, 1);
        assert_eq!(stats.num_clflush, 1);
        assert_eq!(stats.hit_rate(), Some(2.0 / 3.0));
    }

    #[test]
    fn test_write_through_write_invalidates_others() {
        let scc = SccWriteThrough::default();
        let mut meta = SccMeta::default();
        scc.init_scc_metadata(&mut meta, HostId(0));
        let mut shared = vec![0u8; 4];
        let mut out = vec![0u8; 4];
        scc.do_read(&mut meta, HostId(1), &mut out, &shared);
        scc.do_read(&mut meta, HostId(2), &mut out, &shared);
        assert_eq!(meta.bits(), 0b111);

        scc.do_write(&mut meta, HostId(1), &mut shared, &[9, 9, 9, 9]);
        assert_eq!(meta.bits(), 0b010);

        scc.do_read(&mut meta, HostId(0), &mut out, &shared);
        assert_eq!(out, vec![9, 9, 9, 9]);
        assert_eq!(scc.stats().num_cache_miss, 3);
    }

    #[test]
    #[should_panic(expected = "writes a tuple its cache does not hold")]
    fn test_write_through_write_without_read_panics() {
        let scc = SccWriteThrough::default();
        let mut meta = SccMeta::default();
        scc.init_scc_metadata(&mut meta, HostId(0));
        let mut shared = vec![0u8; 4];
        scc.do_write(&mut meta, HostId(1), &mut shared, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_factory() {
        for mechanism in [
            SccMechanism::NoOp,
            SccMechanism::NonTemporal,
            SccMechanism::WriteThrough,
        ] {
            assert_eq!(create_scc_manager(mechanism).mechanism(), mechanism);
        }
    }

    #[test]
    fn test_hit_rate_empty() {
        assert_eq!(SccStats::default().hit_rate(), None);
    }
}
