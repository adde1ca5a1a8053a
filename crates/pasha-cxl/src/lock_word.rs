//! Packed lock word shared by local and shared tuple metadata.
//!
//! Layout (64 bits):
//! - bit 63: write lock
//! - bits 54..63: read lock counter (9 bits)
//! - bits 0..54: version (commit timestamp)
//!
//! The word is a plain value. Callers mutate it only while holding the latch
//! of the metadata record that owns it.

use pasha_common::Tid;

/// Write lock bit.
pub const WRITE_LOCK_BIT: u64 = 1 << 63;

/// Shift of the read lock counter.
pub const READ_COUNT_SHIFT: u32 = 54;

/// Mask of the read lock counter after shifting.
pub const READ_COUNT_MASK: u64 = 0x1ff;

/// Maximum number of concurrent readers.
pub const MAX_READERS: u64 = (1 << 9) - 1;

/// Mask of the version bits.
pub const VERSION_MASK: u64 = (1 << READ_COUNT_SHIFT) - 1;

/// Lock state plus version of one tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct LockWord(u64);

impl LockWord {
    /// Creates an unlocked word at the given version.
    pub fn new(version: Tid) -> Self {
        assert!(
            version <= VERSION_MASK,
            "version {version} overflows the lock word"
        );
        Self(version)
    }

    /// Returns the raw packed value.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Rebuilds a word from its packed value.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn is_write_locked(self) -> bool {
        self.0 & WRITE_LOCK_BIT != 0
    }

    #[inline]
    pub fn read_count(self) -> u64 {
        (self.0 >> READ_COUNT_SHIFT) & READ_COUNT_MASK
    }

    #[inline]
    pub fn is_read_locked(self) -> bool {
        self.read_count() > 0
    }

    #[inline]
    pub fn version(self) -> Tid {
        self.0 & VERSION_MASK
    }

    /// Returns the word with one more reader, or None if a writer holds it
    /// or the counter is at capacity.
    #[inline]
    pub fn try_read_lock(self) -> Option<Self> {
        if self.is_write_locked() || self.read_count() >= MAX_READERS {
            return None;
        }
        Some(Self(self.0 + (1 << READ_COUNT_SHIFT)))
    }

    /// Returns the word with the write bit set, or None if any lock is held.
    #[inline]
    pub fn try_write_lock(self) -> Option<Self> {
        if self.is_write_locked() || self.is_read_locked() {
            return None;
        }
        Some(Self(self.0 | WRITE_LOCK_BIT))
    }

    /// Drops one reader.
    #[inline]
    pub fn read_unlock(self) -> Self {
        assert!(
            self.is_read_locked(),
            "read lock released without being held: {self:?}"
        );
        Self(self.0 - (1 << READ_COUNT_SHIFT))
    }

    /// Clears the write bit and installs a new version.
    #[inline]
    pub fn write_unlock_with(self, version: Tid) -> Self {
        assert!(
            self.is_write_locked(),
            "write lock released without being held: {self:?}"
        );
        assert!(
            version <= VERSION_MASK,
            "version {version} overflows the lock word"
        );
        Self(self.0 & !(WRITE_LOCK_BIT | VERSION_MASK) | version)
    }

    /// Clears the write bit keeping the version.
    #[inline]
    pub fn write_unlock(self) -> Self {
        assert!(
            self.is_write_locked(),
            "write lock released without being held: {self:?}"
        );
        Self(self.0 & !WRITE_LOCK_BIT)
    }

    /// Returns the word with the lock bits replaced, version untouched.
    ///
    /// Used when lock state crosses the migration boundary.
    #[inline]
    pub fn with_locks(self, read_count: u64, write_locked: bool) -> Self {
        assert!(read_count <= MAX_READERS, "read count {read_count} over capacity");
        let mut raw = self.0 & VERSION_MASK;
        raw |= read_count << READ_COUNT_SHIFT;
        if write_locked {
            raw |= WRITE_LOCK_BIT;
        }
        Self(raw)
    }

    /// Returns the version-only part of the word (no locks held).
    #[inline]
    pub fn unlocked(self) -> Self {
        Self(self.0 & VERSION_MASK)
    }
}

impl std::fmt::Display for LockWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "v{} r{}{}",
            self.version(),
            self.read_count(),
            if self.is_write_locked() { " w" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_is_unlocked() {
        let w = LockWord::new(42);
        assert_eq!(w.version(), 42);
        assert_eq!(w.read_count(), 0);
        assert!(!w.is_write_locked());
    }

    #[test]
    fn test_read_locks_stack() {
        let w = LockWord::new(7);
        let w = w.try_read_lock().unwrap();
        let w = w.try_read_lock().unwrap();
        assert_eq!(w.read_count(), 2);
        assert_eq!(w.version(), 7);
        assert!(w.try_write_lock().is_none());

        let w = w.read_unlock().read_unlock();
        assert_eq!(w, LockWord::new(7));
    }

    #[test]
    fn test_write_lock_excludes_everything() {
        let w = LockWord::new(1).try_write_lock().unwrap();
        assert!(w.is_write_locked());
        assert!(w.try_read_lock().is_none());
        assert!(w.try_write_lock().is_none());
    }

    #[test]
    fn test_write_unlock_installs_version() {
        let w = LockWord::new(3).try_write_lock().unwrap();
        let w = w.write_unlock_with(99);
        assert!(!w.is_write_locked());
        assert_eq!(w.version(), 99);

        let w = w.try_write_lock().unwrap().write_unlock();
        assert_eq!(w.version(), 99);
    }

    #[test]
    fn test_reader_cap() {
        let mut w = LockWord::new(0);
        for _ in 0..MAX_READERS {
            w = w.try_read_lock().unwrap();
        }
        assert_eq!(w.read_count(), MAX_READERS);
        assert!(w.try_read_lock().is_none());
        assert!(!w.is_write_locked());
    }

    #[test]
    fn test_with_locks_transfers_state() {
        let local = LockWord::new(10).try_read_lock().unwrap().try_read_lock().unwrap();
        let shared = LockWord::new(10).with_locks(local.read_count(), local.is_write_locked());
        assert_eq!(shared, local);

        let w = LockWord::new(5).with_locks(0, true);
        assert!(w.is_write_locked());
        assert_eq!(w.version(), 5);
        assert_eq!(w.unlocked(), LockWord::new(5));
    }

    #[test]
    #[should_panic(expected = "read lock released without being held")]
    fn test_read_unlock_unheld_panics() {
        LockWord::new(0).read_unlock();
    }

    #[test]
    #[should_panic(expected = "write lock released without being held")]
    fn test_write_unlock_unheld_panics() {
        LockWord::new(0).write_unlock_with(1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Read,
        Write,
        ReleaseRead,
        ReleaseWrite(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Read),
            Just(Op::Write),
            Just(Op::ReleaseRead),
            (0u64..1_000_000).prop_map(Op::ReleaseWrite),
        ]
    }

    proptest! {
        // Mutual exclusion: at most one writer, never readers alongside it,
        // and the reader count never passes its cap.
        #[test]
        fn prop_mutual_exclusion(ops in proptest::collection::vec(op(), 1..400)) {
            let mut word = LockWord::new(0);
            let mut readers = 0u64;
            let mut writer = false;

            for op in ops {
                match op {
                    Op::Read => match word.try_read_lock() {
                        Some(w) => { word = w; readers += 1; }
                        None => prop_assert!(writer || readers == MAX_READERS),
                    },
                    Op::Write => match word.try_write_lock() {
                        Some(w) => { word = w; writer = true; }
                        None => prop_assert!(writer || readers > 0),
                    },
                    Op::ReleaseRead if readers > 0 => { word = word.read_unlock(); readers -= 1; }
                    Op::ReleaseWrite(v) if writer => { word = word.write_unlock_with(v); writer = false; }
                    _ => {}
                }
                prop_assert!(!(writer && readers > 0));
                prop_assert_eq!(word.read_count(), readers);
                prop_assert_eq!(word.is_write_locked(), writer);
                prop_assert!(word.read_count() <= MAX_READERS);
            }
        }
    }
}
