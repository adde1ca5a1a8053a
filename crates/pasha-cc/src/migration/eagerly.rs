//! Eager residency: once over budget, every unreferenced tuple of the
//! partition goes back out.

use super::{TrackedRow, VictimOrder};
use crate::helper::TwoPlPashaHelper;
use pasha_common::PartitionId;
use pasha_cxl::RegionKey;
use std::collections::{HashMap, HashSet};

/// Tracked tuples grouped by partition, in no particular order.
#[derive(Debug, Default)]
pub struct EagerOrder {
    partitions: HashMap<PartitionId, HashMap<RegionKey, TrackedRow>>,
    len: usize,
}

impl VictimOrder for EagerOrder {
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

    fn next_victim(
        &mut self,
        partition: PartitionId,
        _helper: &TwoPlPashaHelper,
        refused: &HashSet<RegionKey>,
    ) -> Option<TrackedRow> {
        self.partitions
            .get(&partition)?
            .values()
            .find(|r| !refused.contains(&r.region_key))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_offers_every_row_of_partition() {
        let helper = helper();
        let table = table(3, 0..4);
        let mut order = EagerOrder::default();
        for row in migrate(&helper, &table, &[0, 1, 2, 3]) {
            order.track(row);
        }
        let mut keys = drain_order(&mut order, &helper, PartitionId(3));
        keys.sort_unstable();
        assert_eq!(keys, vec![0, 1, 2, 3]);
        assert!(order.is_empty());
        assert!(drain_order(&mut order, &helper, PartitionId(0)).is_empty());
    }
}
