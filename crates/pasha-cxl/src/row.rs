//! Shared tuple metadata and bytes resident in the CXL pool.

use crate::index::RegionKey;
use crate::lock_word::LockWord;
use crate::scc::SccMeta;
use parking_lot::{Mutex, MutexGuard};
use pasha_common::Tid;

/// Bytes accounted to the metadata category per shared tuple.
pub const SHARED_ROW_METADATA_BYTES: u64 = 64;

/// A migrated tuple. Every field lives behind the latch.
pub struct SharedRow {
    latch: Mutex<SharedRowState>,
}

/// Latch-protected state of a shared tuple.
#[derive(Debug, Default)]
pub struct SharedRowState {
    /// Reader count, write bit and version.
    pub lock_word: LockWord,
    /// Number of remote transactions holding this copy in place.
    pub ref_cnt: u64,
    /// False for insert placeholders and deleted tuples.
    pub is_valid: bool,
    /// Per-host coherence bits.
    pub scc: SccMeta,
    /// A non-owner wrote the bytes since the tuple moved in.
    pub modified_since_moved_in: bool,
    /// The next key in sort order is also in the shared region.
    pub next_key_real: bool,
    /// The previous key in sort order is also in the shared region.
    pub prev_key_real: bool,
    /// Home location of the tuple, None while the slot is vacant.
    pub owner: Option<RegionKey>,
    /// Pool access clock at the last owner access.
    pub last_access: u64,
    /// Set on access, cleared by the clock hand.
    pub referenced: bool,
    /// Tuple value.
    pub data: Box<[u8]>,
}

impl SharedRow {
    /// Creates a vacant slot.
    pub fn vacant() -> Self {
        Self {
            latch: Mutex::new(SharedRowState::default()),
        }
    }

    /// Takes the tuple latch.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, SharedRowState> {
        self.latch.lock()
    }
}

impl SharedRowState {
    /// Prepares a vacant slot for a tuple moving in.
    pub fn init(&mut self, owner: RegionKey, value_size: usize) {
        assert!(self.owner.is_none(), "init of occupied shared row {:?}", self.owner);
        *self = SharedRowState {
            owner: Some(owner),
            data: vec![0u8; value_size].into_boxed_slice(),
            ..Default::default()
        };
    }

    /// Clears the metadata of a cached copy that is moving back in. The
    /// owner and bytes are kept.
    pub fn reset_metadata(&mut self) {
        assert!(self.owner.is_some(), "reuse of vacant shared row");
        assert_eq!(self.ref_cnt, 0, "reuse of shared row {:?} with live references", self.owner);
        let owner = self.owner.take();
        let data = std::mem::take(&mut self.data);
        *self = SharedRowState {
            owner,
            data,
            ..Default::default()
        };
    }

    /// Returns the slot to its vacant state, yielding the freed data size.
    pub fn teardown(&mut self) -> usize {
        assert_eq!(
            self.ref_cnt, 0,
            "teardown of shared row {:?} with live references",
            self.owner
        );
        let freed = self.data.len();
        *self = SharedRowState::default();
        freed
    }

    #[inline]
    pub fn tid(&self) -> Tid {
        self.lock_word.version()
    }

    #[inline]
    pub fn inc_ref_cnt(&mut self) {
        self.ref_cnt += 1;
    }

    #[inline]
    pub fn dec_ref_cnt(&mut self) {
        assert!(
            self.ref_cnt > 0,
            "reference count of {:?} going negative",
            self.owner
        );
        self.ref_cnt -= 1;
    }

    /// Takes a read lock, returning the version on success.
    #[inline]
    pub fn try_read_lock(&mut self) -> Option<Tid> {
        self.lock_word = self.lock_word.try_read_lock()?;
        Some(self.lock_word.version())
    }

    /// Takes a write lock, returning the version on success.
    #[inline]
    pub fn try_write_lock(&mut self) -> Option<Tid> {
        self.lock_word = self.lock_word.try_write_lock()?;
        Some(self.lock_word.version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pasha_common::{PartitionId, TableId};

    fn key(k: u64) -> RegionKey {
        RegionKey::new(TableId(0), PartitionId(1), k)
    }

    #[test]
    fn test_init_and_teardown() {
        let row = SharedRow::vacant();
        let mut st = row.lock();
        st.init(key(5), 16);
        assert_eq!(st.owner, Some(key(5)));
        assert_eq!(st.data.len(), 16);
        assert!(!st.is_valid);
        assert_eq!(st.teardown(), 16);
        assert!(st.owner.is_none());
        assert!(st.data.is_empty());
    }

    #[test]
    fn test_locking_through_state() {
        let row = SharedRow::vacant();
        let mut st = row.lock();
        st.init(key(1), 4);
        st.lock_word = LockWord::new(9);
        assert_eq!(st.try_read_lock(), Some(9));
        assert_eq!(st.try_write_lock(), None);
        st.lock_word = st.lock_word.read_unlock();
        assert_eq!(st.try_write_lock(), Some(9));
        assert_eq!(st.try_read_lock(), None);
    }

    #[test]
    fn test_reset_metadata_keeps_bytes() {
        let row = SharedRow::vacant();
        let mut st = row.lock();
        st.init(key(3), 4);
        st.data.copy_from_slice(b"abcd");
        st.is_valid = true;
        st.next_key_real = true;
        st.lock_word = LockWord::new(12).with_locks(2, false);

        st.reset_metadata();
        assert_eq!(st.owner, Some(key(3)));
        assert_eq!(&st.data[..], b"abcd");
        assert!(!st.is_valid);
        assert!(!st.next_key_real);
        assert_eq!(st.lock_word, LockWord::default());
    }

    #[test]
    #[should_panic(expected = "going negative")]
    fn test_ref_underflow_panics() {
        let row = SharedRow::vacant();
        row.lock().dec_ref_cnt();
    }

    #[test]
    #[should_panic(expected = "live references")]
    fn test_teardown_with_refs_panics() {
        let row = SharedRow::vacant();
        let mut st = row.lock();
        st.init(key(2), 4);
        st.inc_ref_cnt();
        st.teardown();
    }
}
