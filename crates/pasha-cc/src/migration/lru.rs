//! Least-recently-used residency.
//!
//! Access stamps live in the shared tuples, so accesses by any host count.
//! Each round sorts the partition's tuples by stamp once.

use super::{TrackedRow, VictimOrder};
use crate::helper::TwoPlPashaHelper;
use pasha_common::PartitionId;
use pasha_cxl::RegionKey;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct LruOrder {
    partitions: HashMap<PartitionId, HashMap<RegionKey, TrackedRow>>,
    len: usize,
    /// Victims of the current round, most recently used first.
    round: Vec<TrackedRow>,
}

impl VictimOrder for LruOrder {
    fn track(&mut self, row: TrackedRow) {
        let rows = self.partitions.entry(row.region_key.partition).or_default();
        if rows.insert(row.region_key, row).is_none() {
            self.len += 1;
        }
    }

    fn untrack(&mut self, key: &RegionKey) -> bool {
        let removed = self
            .partitions
            .get_mut(&key.partition)
            .and_then(|rows| rows.remove(key))
            .is_some();
        if removed {
            self.len -= 1;
        }
        removed
    }

    fn len(&self) -> usize {
        self.len
    }

    fn begin_round(&mut self, partition: PartitionId, helper: &TwoPlPashaHelper) {
        self.round.clear();
        let Some(rows) = self.partitions.get(&partition) else {
            return;
        };
        let mut stamped: Vec<(u64, &TrackedRow)> = rows
            .values()
            .map(|r| (helper.last_access(&r.region_key).unwrap_or(0), r))
            .collect();
        stamped.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(b.1.key.cmp(&a.1.key)));
        self.round = stamped.into_iter().map(|(_, r)| r.clone()).collect();
    }

    fn next_victim(
        &mut self,
        partition: PartitionId,
        _helper: &TwoPlPashaHelper,
        refused: &HashSet<RegionKey>,
    ) -> Option<TrackedRow> {
        let rows = self.partitions.get(&partition)?;
        while let Some(row) = self.round.pop() {
            if rows.contains_key(&row.region_key) && !refused.contains(&row.region_key) {
                return Some(row);
            }
        }
        None
    }
}
