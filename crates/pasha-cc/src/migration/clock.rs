//! Second-chance residency.
//!
//! Each partition keeps a ring of its tracked tuples and a clock hand. The
//! reference bit lives in the shared tuple and is set by every access. The
//! hand clears set bits as it passes and picks the first tuple whose bit is
//! already clear.

use super::{TrackedRow, VictimOrder};
use crate::helper::TwoPlPashaHelper;
use pasha_common::PartitionId;
use pasha_cxl::RegionKey;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
struct Ring {
    rows: Vec<TrackedRow>,
    hand: usize,
}

#[derive(Debug, Default)]
pub struct ClockOrder {
    rings: HashMap<PartitionId, Ring>,
    len: usize,
}

impl ClockOrder {
    /// Position of the hand in a partition's ring.
    pub fn hand(&self, partition: PartitionId) -> usize {
        self.rings.get(&partition).map_or(0, |r| r.hand)
    }
}

impl VictimOrder for ClockOrder {
    fn track(&mut self, row: TrackedRow) {
        let ring = self.rings.entry(row.region_key.partition).or_default();
        // New tuples enter just behind the hand so they are visited last.
        let at = ring.hand;
        ring.rows.insert(at, row);
        ring.hand = (at + 1) % ring.rows.len();
        self.len += 1;
    }

    fn untrack(&mut self, key: &RegionKey) -> bool {
        let Some(ring) = self.rings.get_mut(&key.partition) else {
            return false;
        };
        let Some(pos) = ring.rows.iter().position(|r| r.region_key == *key) else {
            return false;
        };
        ring.rows.remove(pos);
        if pos < ring.hand {
            ring.hand -= 1;
        }
        if ring.hand >= ring.rows.len() {
            ring.hand = 0;
        }
        self.len -= 1;
        true
    }

    fn len(&self) -> usize {
        self.len
    }

    fn next_victim(
        &mut self,
        partition: PartitionId,
        helper: &TwoPlPashaHelper,
        refused: &HashSet<RegionKey>,
    ) -> Option<TrackedRow> {
        let ring = self.rings.get_mut(&partition)?;
        let n = ring.rows.len();
        if n == 0 {
            return None;
        }

        // At most two rotations: the first clears reference bits.
        for _ in 0..(2 * n) {
            let hand = ring.hand;
            ring.hand = (hand + 1) % n;
            let row = &ring.rows[hand];
            if refused.contains(&row.region_key) {
                continue;
            }
            if helper.take_reference_bit(&row.region_key) != Some(true) {
                return Some(row.clone());
            }
        }

        // Bits were set again behind the hand; take any candidate.
        ring.rows
            .iter()
            .find(|r| !refused.contains(&r.region_key))
            .cloned()
    }
}
