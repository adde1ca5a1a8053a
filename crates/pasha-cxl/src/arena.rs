//! Fixed-capacity slot arena with offset-stable typed handles.
//!
//! The arena stands in for CXL-addressable memory: a slot index means the
//! same thing on every host, and slots never move once the arena is built.

use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Offset-stable reference to a `T` living in the CXL pool.
///
/// A handle is plain data. It does not keep the slot alive; the pool and
/// epoch-based reclamation decide when a slot is recycled.
pub struct SharedHandle<T> {
    slot: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SharedHandle<T> {
    /// Creates a handle for a slot index.
    #[inline]
    pub const fn new(slot: u32) -> Self {
        Self {
            slot,
            _marker: PhantomData,
        }
    }

    /// Returns the slot index.
    #[inline]
    pub fn slot(self) -> u32 {
        self.slot
    }

    /// Encodes the handle for roots and retired-object records.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.slot as u64
    }

    /// Decodes a handle produced by `to_raw`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        assert!(raw <= u32::MAX as u64, "raw handle {raw} out of range");
        Self::new(raw as u32)
    }
}

impl<T> Clone for SharedHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SharedHandle<T> {}

impl<T> PartialEq for SharedHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot
    }
}

impl<T> Eq for SharedHandle<T> {}

impl<T> std::hash::Hash for SharedHandle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
    }
}

impl<T> std::fmt::Debug for SharedHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedHandle({})", self.slot)
    }
}

impl<T> std::fmt::Display for SharedHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cxl:{}", self.slot)
    }
}

/// Preallocated slots of `T` with a free list.
///
/// Slots are constructed once up front. Allocation only flips the occupancy
/// bit; callers initialize the slot's contents through its own interior
/// mutability.
pub struct SlotArena<T> {
    slots: Box<[T]>,
    occupied: Box<[AtomicBool]>,
    free_list: Mutex<Vec<u32>>,
    in_use: AtomicUsize,
}

impl<T> SlotArena<T> {
    /// Creates an arena of `capacity` vacant slots.
    pub fn new(capacity: usize, mut make: impl FnMut() -> T) -> Self {
        assert!(capacity <= u32::MAX as usize, "arena capacity {capacity} too large");
        let slots: Box<[T]> = (0..capacity).map(|_| make()).collect();
        let occupied: Box<[AtomicBool]> = (0..capacity).map(|_| AtomicBool::new(false)).collect();
        // Reversed so the lowest slot is handed out first.
        let free_list: Vec<u32> = (0..capacity as u32).rev().collect();

        Self {
            slots,
            occupied,
            free_list: Mutex::new(free_list),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Returns the total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of occupied slots.
    pub fn len(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Returns true if no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims a vacant slot.
    pub fn alloc(&self) -> Option<SharedHandle<T>> {
        let slot = self.free_list.lock().pop()?;
        let was_occupied = self.occupied[slot as usize].swap(true, Ordering::AcqRel);
        assert!(!was_occupied, "slot {slot} on the free list while occupied");
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Some(SharedHandle::new(slot))
    }

    /// Returns a slot to the free list.
    pub fn free(&self, handle: SharedHandle<T>) {
        let idx = handle.slot as usize;
        assert!(idx < self.slots.len(), "{handle} out of bounds");
        let was_occupied = self.occupied[idx].swap(false, Ordering::AcqRel);
        assert!(was_occupied, "double free of {handle}");
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        self.free_list.lock().push(handle.slot);
    }

    /// Resolves a handle to its slot if it is in bounds and occupied.
    #[inline]
    pub fn get(&self, handle: SharedHandle<T>) -> Option<&T> {
        let idx = handle.slot as usize;
        if idx >= self.slots.len() || !self.occupied[idx].load(Ordering::Acquire) {
            return None;
        }
        Some(&self.slots[idx])
    }

    /// Returns true if the slot behind `handle` is occupied.
    pub fn is_occupied(&self, handle: SharedHandle<T>) -> bool {
        self.get(handle).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_handle_raw_roundtrip() {
        let h: SharedHandle<u64> = SharedHandle::new(77);
        assert_eq!(SharedHandle::<u64>::from_raw(h.to_raw()), h);
        assert_eq!(h.to_string(), "cxl:77");
    }

    #[test]
    fn test_alloc_lowest_first() {
        let arena = SlotArena::new(4, || AtomicU64::new(0));
        assert_eq!(arena.alloc().unwrap().slot(), 0);
        assert_eq!(arena.alloc().unwrap().slot(), 1);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let arena = SlotArena::new(2, || AtomicU64::new(0));
        let a = arena.alloc().unwrap();
        let _b = arena.alloc().unwrap();
        assert!(arena.alloc().is_none());

        arena.free(a);
        assert!(arena.get(a).is_none());
        let c = arena.alloc().unwrap();
        assert_eq!(c, a);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_get_out_of_bounds() {
        let arena = SlotArena::new(2, || AtomicU64::new(0));
        assert!(arena.get(SharedHandle::new(9)).is_none());
    }

    #[test]
    fn test_slot_contents_shared() {
        let arena = SlotArena::new(2, || AtomicU64::new(0));
        let h = arena.alloc().unwrap();
        arena.get(h).unwrap().store(5, Ordering::Relaxed);
        assert_eq!(arena.get(h).unwrap().load(Ordering::Relaxed), 5);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let arena = SlotArena::new(2, || AtomicU64::new(0));
        let h = arena.alloc().unwrap();
        arena.free(h);
        arena.free(h);
    }
}
