//! Residency without eviction. Tuples leave the shared region only when
//! deleted.

use super::{TrackedRow, VictimOrder};
use crate::helper::TwoPlPashaHelper;
use pasha_common::PartitionId;
use pasha_cxl::RegionKey;
use std::collections::HashSet;

/// Counts tracked tuples and never offers a victim.
#[derive(Debug, Default)]
pub struct NeverEvict {
    rows: HashSet<RegionKey>,
}

impl VictimOrder for NeverEvict {
    fn track(&mut self, row: TrackedRow) {
        self.rows.insert(row.region_key);
    }

    fn untrack(&mut self, key: &RegionKey) -> bool {
        self.rows.remove(key)
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn next_victim(
        &mut self,
        _partition: PartitionId,
        _helper: &TwoPlPashaHelper,
        _refused: &HashSet<RegionKey>,
    ) -> Option<TrackedRow> {
        None
    }
}
