//! First-in first-out residency.

use super::{TrackedRow, VictimOrder};
use crate::helper::TwoPlPashaHelper;
use pasha_common::PartitionId;
use pasha_cxl::RegionKey;
use std::collections::{HashMap, HashSet, VecDeque};

/// Per-partition queues in move-in order.
#[derive(Debug, Default)]
pub struct FifoOrder {
    queues: HashMap<PartitionId, VecDeque<TrackedRow>>,
    len: usize,
}

impl VictimOrder for FifoOrder {
    fn track(&mut self, row: TrackedRow) {
        self.queues
            .entry(row.region_key.partition)
            .or_default()
            .push_back(row);
        self.len += 1;
    }

    fn untrack(&mut self, key: &RegionKey) -> bool {
        let Some(queue) = self.queues.get_mut(&key.partition) else {
            return false;
        };
        match queue.iter().position(|r| r.region_key == *key) {
            Some(pos) => {
                queue.remove(pos);
                self.len -= 1;
                true
            }
            None => false,
        }
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
        self.queues
            .get(&partition)?
            .iter()
            .find(|r| !refused.contains(&r.region_key))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_victims_in_arrival_order() {
        let helper = helper();
        let table = table(0, 0..5);
        let mut order = FifoOrder::default();
        for row in migrate(&helper, &table, &[3, 1, 4, 0, 2]) {
            order.track(row);
        }
        assert!(order.untrack(&TwoPlPashaHelper::region_key(table.as_ref(), 4)));
        assert!(!order.untrack(&TwoPlPashaHelper::region_key(table.as_ref(), 4)));
        assert_eq!(drain_order(&mut order, &helper, PartitionId(0)), vec![3, 1, 0, 2]);
    }

    #[test]
    fn test_refused_rows_are_skipped() {
        let helper = helper();
        let table = table(0, 0..3);
        let mut order = FifoOrder::default();
        let rows = migrate(&helper, &table, &[0, 1, 2]);
        let refused: HashSet<_> = [rows[0].region_key].into_iter().collect();
        for row in rows {
            order.track(row);
        }
        let victim = order.next_victim(PartitionId(0), &helper, &refused).unwrap();
        assert_eq!(victim.key, 1);
    }
}
