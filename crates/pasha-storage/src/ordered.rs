//! Key-ordered table.

use crate::row::LocalRow;
use crate::table::{Adjacent, RowEntry, Table, TableKind};
use parking_lot::RwLock;
use pasha_common::{Key, PartitionId, TableId};
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;

/// Key of the permanent placeholder every ordered table carries, so each
/// real key has a successor to lock.
pub const MAX_KEY: Key = Key::MAX;

/// B-tree backed table supporting scans and next-key locking.
pub struct OrderedTable {
    table_id: TableId,
    partition_id: PartitionId,
    value_size: usize,
    rows: RwLock<BTreeMap<Key, RowEntry>>,
}

impl OrderedTable {
    pub fn new(table_id: TableId, partition_id: PartitionId, value_size: usize) -> Self {
        let mut rows = BTreeMap::new();
        let placeholder = Arc::new(LocalRow::new(&vec![0u8; value_size], false));
        rows.insert(MAX_KEY, RowEntry::new(MAX_KEY, placeholder));
        Self {
            table_id,
            partition_id,
            value_size,
            rows: RwLock::new(rows),
        }
    }

    fn prev_of(rows: &BTreeMap<Key, RowEntry>, key: Key) -> Option<&RowEntry> {
        rows.range(..key).next_back().map(|(_, e)| e)
    }

    fn next_of(rows: &BTreeMap<Key, RowEntry>, key: Key) -> Option<&RowEntry> {
        rows.range((Excluded(key), Unbounded)).next().map(|(_, e)| e)
    }

    fn check_value(&self, value: &[u8]) {
        assert_eq!(
            value.len(),
            self.value_size,
            "{}/{}: value of {} bytes, expected {}",
            self.table_id,
            self.partition_id,
            value.len(),
            self.value_size
        );
    }
}

impl Table for OrderedTable {
    fn table_id(&self) -> TableId {
        self.table_id
    }

    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn kind(&self) -> TableKind {
        TableKind::Ordered
    }

    fn value_size(&self) -> usize {
        self.value_size
    }

    fn len(&self) -> usize {
        self.rows.read().len()
    }

    fn search(&self, key: Key) -> Option<Arc<LocalRow>> {
        self.rows.read().get(&key).map(|e| Arc::clone(&e.row))
    }

    fn insert(&self, key: Key, value: &[u8], is_placeholder: bool) -> Option<Arc<LocalRow>> {
        self.check_value(value);
        let mut rows = self.rows.write();
        if rows.contains_key(&key) {
            return None;
        }
        let row = Arc::new(LocalRow::new(value, !is_placeholder));
        rows.insert(key, RowEntry::new(key, Arc::clone(&row)));
        Some(row)
    }

    fn remove(&self, key: Key) -> Option<Arc<LocalRow>> {
        assert_ne!(key, MAX_KEY, "the max-key placeholder is permanent");
        self.rows.write().remove(&key).map(|e| e.row)
    }

    fn keys(&self) -> Vec<Key> {
        self.rows.read().keys().copied().filter(|k| *k != MAX_KEY).collect()
    }

    fn scan(&self, min_key: Key, processor: &mut dyn FnMut(&RowEntry) -> bool) {
        let rows = self.rows.read();
        for (_, entry) in rows.range(min_key..) {
            if !processor(entry) {
                break;
            }
        }
    }

    fn search_and_update_next_key_info(
        &self,
        key: Key,
        processor: &mut dyn FnMut(Adjacent<'_>) -> bool,
    ) -> Option<bool> {
        let rows = self.rows.write();
        let cur = rows.get(&key)?;
        Some(processor(Adjacent {
            prev: Self::prev_of(&rows, key),
            cur,
            next: Self::next_of(&rows, key),
        }))
    }

    fn insert_and_process_adjacent_tuples(
        &self,
        key: Key,
        value: &[u8],
        is_placeholder: bool,
        processor: &mut dyn FnMut(Option<&RowEntry>, Option<&RowEntry>) -> bool,
    ) -> Option<Arc<LocalRow>> {
        self.check_value(value);
        let mut rows = self.rows.write();
        if rows.contains_key(&key) {
            return None;
        }
        if !processor(Self::prev_of(&rows, key), Self::next_of(&rows, key)) {
            return None;
        }
        let row = Arc::new(if is_placeholder {
            LocalRow::new_placeholder(value)
        } else {
            LocalRow::new(value, true)
        });
        rows.insert(key, RowEntry::new(key, Arc::clone(&row)));
        Some(row)
    }

    fn remove_and_process_adjacent_tuples(
        &self,
        key: Key,
        processor: &mut dyn FnMut(Adjacent<'_>) -> bool,
    ) -> bool {
        assert_ne!(key, MAX_KEY, "the max-key placeholder is permanent");
        let mut rows = self.rows.write();
        let Some(cur) = rows.get(&key) else {
            return false;
        };
        processor(Adjacent {
            prev: Self::prev_of(&rows, key),
            cur,
            next: Self::next_of(&rows, key),
        });
        rows.remove(&key);
        true
    }
}
