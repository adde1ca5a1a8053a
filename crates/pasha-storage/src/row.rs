//! Partition-local tuple metadata.

use parking_lot::{Mutex, MutexGuard};
use pasha_common::Tid;
use pasha_cxl::{LockWord, SharedHandle, SharedRow};

/// A tuple owned by one partition.
///
/// Lock state lives in the local word while the tuple is at home. Once
/// migrated, `migrated` points at the authoritative shared copy and the
/// local word and bytes are stale until the tuple moves back.
pub struct LocalRow {
    latch: Mutex<LocalRowState>,
}

/// Latch-protected state of a local tuple.
#[derive(Debug)]
pub struct LocalRowState {
    pub lock_word: LockWord,
    pub is_valid: bool,
    /// Shared copy currently holding the tuple, if migrated.
    pub migrated: Option<SharedHandle<SharedRow>>,
    /// Shared copy retained after the last move-out, reused on the next
    /// move-in.
    pub cached_shared: Option<SharedHandle<SharedRow>>,
    /// Local bytes changed since the tuple last left the shared region.
    pub modified_since_moved_out: bool,
    pub data: Box<[u8]>,
}

impl LocalRow {
    pub fn new(value: &[u8], is_valid: bool) -> Self {
        Self {
            latch: Mutex::new(LocalRowState {
                lock_word: LockWord::default(),
                is_valid,
                migrated: None,
                cached_shared: None,
                modified_since_moved_out: true,
                data: value.into(),
            }),
        }
    }

    /// An invalid tuple already write-locked for the transaction inserting
    /// it.
    pub fn new_placeholder(value: &[u8]) -> Self {
        let row = Self::new(value, false);
        row.lock().lock_word = LockWord::default().with_locks(0, true);
        row
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, LocalRowState> {
        self.latch.lock()
    }

    /// Reads the migrated handle without holding the latch afterwards.
    pub fn migrated(&self) -> Option<SharedHandle<SharedRow>> {
        self.latch.lock().migrated
    }
}

impl std::fmt::Debug for LocalRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRow").field("state", &*self.latch.lock()).finish()
    }
}

impl LocalRowState {
    #[inline]
    pub fn is_migrated(&self) -> bool {
        self.migrated.is_some()
    }

    #[inline]
    pub fn tid(&self) -> Tid {
        self.lock_word.version()
    }

    #[inline]
    pub fn try_read_lock(&mut self) -> Option<Tid> {
        self.lock_word = self.lock_word.try_read_lock()?;
        Some(self.lock_word.version())
    }

    #[inline]
    pub fn try_write_lock(&mut self) -> Option<Tid> {
        self.lock_word = self.lock_word.try_write_lock()?;
        Some(self.lock_word.version())
    }

    /// Overwrites the local bytes, marking them dirty for the next move-in.
    pub fn write_data(&mut self, value: &[u8]) {
        assert_eq!(
            value.len(),
            self.data.len(),
            "value of {} bytes for a {}-byte tuple",
            value.len(),
            self.data.len()
        );
        self.data.copy_from_slice(value);
        self.modified_since_moved_out = true;
    }
}
