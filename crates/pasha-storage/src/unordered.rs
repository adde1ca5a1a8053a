//! Hash-backed table.

use crate::row::LocalRow;
use crate::table::{Adjacent, RowEntry, Table, TableKind};
use parking_lot::RwLock;
use pasha_common::{Key, PartitionId, TableId};
use std::collections::HashMap;
use std::sync::Arc;

const SHARD_COUNT: usize = 16;

/// Point-access table split into independently locked shards.
pub struct UnorderedTable {
    table_id: TableId,
    partition_id: PartitionId,
    value_size: usize,
    shards: Box<[RwLock<HashMap<Key, RowEntry>>]>,
}

impl UnorderedTable {
    pub fn new(table_id: TableId, partition_id: PartitionId, value_size: usize) -> Self {
        Self {
            table_id,
            partition_id,
            value_size,
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    #[inline]
    fn shard(&self, key: Key) -> &RwLock<HashMap<Key, RowEntry>> {
        let h = key.wrapping_mul(0x517cc1b727220a95);
        &self.shards[(h >> 60) as usize % SHARD_COUNT]
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

impl Table for UnorderedTable {
    fn table_id(&self) -> TableId {
        self.table_id
    }

    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn kind(&self) -> TableKind {
        TableKind::Unordered
    }

    fn value_size(&self) -> usize {
        self.value_size
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    fn search(&self, key: Key) -> Option<Arc<LocalRow>> {
        self.shard(key).read().get(&key).map(|e| Arc::clone(&e.row))
    }

    fn insert(&self, key: Key, value: &[u8], is_placeholder: bool) -> Option<Arc<LocalRow>> {
        self.check_value(value);
        let mut shard = self.shard(key).write();
        if shard.contains_key(&key) {
            return None;
        }
        let row = Arc::new(LocalRow::new(value, !is_placeholder));
        shard.insert(key, RowEntry::new(key, Arc::clone(&row)));
        Some(row)
    }

    fn remove(&self, key: Key) -> Option<Arc<LocalRow>> {
        self.shard(key).write().remove(&key).map(|e| e.row)
    }

    fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self
            .shards
            .iter()
            .flat_map(|s| s.read().keys().copied().collect::<Vec<_>>())
            .collect();
        keys.sort_unstable();
        keys
    }

    fn scan(&self, _min_key: Key, _processor: &mut dyn FnMut(&RowEntry) -> bool) {
        panic!(
            "scan on unordered table {}/{}",
            self.table_id, self.partition_id
        );
    }

    fn search_and_update_next_key_info(
        &self,
        key: Key,
        processor: &mut dyn FnMut(Adjacent<'_>) -> bool,
    ) -> Option<bool> {
        let shard = self.shard(key).write();
        let cur = shard.get(&key)?;
        Some(processor(Adjacent {
            prev: None,
            cur,
            next: None,
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
        let mut shard = self.shard(key).write();
        if shard.contains_key(&key) || !processor(None, None) {
            return None;
        }
        let row = Arc::new(if is_placeholder {
            LocalRow::new_placeholder(value)
        } else {
            LocalRow::new(value, true)
        });
        shard.insert(key, RowEntry::new(key, Arc::clone(&row)));
        Some(row)
    }

    fn remove_and_process_adjacent_tuples(
        &self,
        key: Key,
        processor: &mut dyn FnMut(Adjacent<'_>) -> bool,
    ) -> bool {
        let mut shard = self.shard(key).write();
        let Some(cur) = shard.get(&key) else {
            return false;
        };
        processor(Adjacent {
            prev: None,
            cur,
            next: None,
        });
        shard.remove(&key);
        true
    }
}
