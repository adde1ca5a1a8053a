//! The table abstraction the concurrency protocol runs against.

use crate::row::LocalRow;
use pasha_common::{Key, PartitionId, TableId};
use std::cmp::Ordering;
use std::sync::Arc;

/// Index flavour backing a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    /// Key-ordered, supports scans and next-key locking.
    Ordered,
    /// Hash-partitioned point access only.
    Unordered,
}

/// A row together with its key.
#[derive(Debug, Clone)]
pub struct RowEntry {
    pub key: Key,
    pub row: Arc<LocalRow>,
}

impl RowEntry {
    pub fn new(key: Key, row: Arc<LocalRow>) -> Self {
        Self { key, row }
    }
}

/// Neighbourhood handed to adjacency processors. Unordered tables never
/// report neighbours.
pub struct Adjacent<'a> {
    pub prev: Option<&'a RowEntry>,
    pub cur: &'a RowEntry,
    pub next: Option<&'a RowEntry>,
}

/// A partition of one table.
///
/// Every row, valid or not, is an `Arc<LocalRow>` that stays put until
/// removed. The `*_adjacent*` and `search_and_update_next_key_info`
/// methods run their processor with the table's structure frozen, so the
/// neighbours it sees cannot change underneath it. Processors may take row
/// latches but must not call back into the table.
pub trait Table: Send + Sync {
    fn table_id(&self) -> TableId;

    fn partition_id(&self) -> PartitionId;

    fn kind(&self) -> TableKind;

    fn key_size(&self) -> usize {
        std::mem::size_of::<Key>()
    }

    fn value_size(&self) -> usize;

    /// Number of rows, placeholders included.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key used by the shared-region index.
    fn get_plain_key(&self, key: Key) -> u64 {
        key
    }

    fn compare_key(&self, a: Key, b: Key) -> Ordering {
        a.cmp(&b)
    }

    fn search(&self, key: Key) -> Option<Arc<LocalRow>>;

    /// Inserts a row, returning None if the key is taken. Placeholders are
    /// inserted invalid.
    fn insert(&self, key: Key, value: &[u8], is_placeholder: bool) -> Option<Arc<LocalRow>>;

    fn remove(&self, key: Key) -> Option<Arc<LocalRow>>;

    /// Keys of every row in ascending order, the max-key placeholder excluded.
    fn keys(&self) -> Vec<Key>;

    /// Visits rows with key >= `min_key` in key order until `processor`
    /// returns false.
    ///
    /// # Panics
    ///
    /// Panics on unordered tables.
    fn scan(&self, min_key: Key, processor: &mut dyn FnMut(&RowEntry) -> bool);

    /// Runs `processor` on the row at `key` and its neighbours. Returns None
    /// if the key is absent.
    fn search_and_update_next_key_info(
        &self,
        key: Key,
        processor: &mut dyn FnMut(Adjacent<'_>) -> bool,
    ) -> Option<bool>;

    /// Runs `processor` on the would-be neighbours of `key` and inserts the
    /// row only if it returns true. Returns None if the key is taken or the
    /// processor refused. A placeholder is born write-locked.
    fn insert_and_process_adjacent_tuples(
        &self,
        key: Key,
        value: &[u8],
        is_placeholder: bool,
        processor: &mut dyn FnMut(Option<&RowEntry>, Option<&RowEntry>) -> bool,
    ) -> Option<Arc<LocalRow>>;

    /// Runs `processor` on the row at `key` and its neighbours, then
    /// removes the row. Returns false if the key is absent.
    fn remove_and_process_adjacent_tuples(
        &self,
        key: Key,
        processor: &mut dyn FnMut(Adjacent<'_>) -> bool,
    ) -> bool;
}
