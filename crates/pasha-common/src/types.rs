//! Identifiers shared across the Pasha crates.

use serde::{Deserialize, Serialize};

/// Structured tuple key. Tables map it to a plain key for the shared-region index.
pub type Key = u64;

/// Commit timestamp written into a tuple's lock word.
pub type Tid = u64;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            /// Returns the identifier as a usize for indexing.
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($label, "{}"), self.0)
            }
        }
    };
}

id_newtype!(
    /// Table identifier, dense from zero.
    TableId,
    "t"
);
id_newtype!(
    /// Partition identifier, dense from zero.
    PartitionId,
    "p"
);
id_newtype!(
    /// Host (coordinator) identifier. Host 0 is the leader.
    HostId,
    "h"
);
id_newtype!(
    /// Worker identifier, unique across the whole cluster.
    WorkerId,
    "w"
);

impl HostId {
    /// The host that allocates and publishes cluster-wide shared structures.
    pub const LEADER: HostId = HostId(0);

    /// Returns true if this host is the leader.
    pub fn is_leader(self) -> bool {
        self == Self::LEADER
    }
}

/// Maps partitions to their owning host.
///
/// Partitions are striped round-robin across hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    host_num: u32,
    partition_num: u32,
}

impl Partitioner {
    /// Creates a partitioner for the given cluster shape.
    pub fn new(host_num: u32, partition_num: u32) -> Self {
        assert!(host_num > 0, "cluster needs at least one host");
        assert!(
            partition_num >= host_num,
            "every host must own at least one partition"
        );
        Self {
            host_num,
            partition_num,
        }
    }

    /// Returns the number of hosts.
    pub fn host_num(&self) -> u32 {
        self.host_num
    }

    /// Returns the number of partitions.
    pub fn partition_num(&self) -> u32 {
        self.partition_num
    }

    /// Returns the host owning a partition.
    #[inline]
    pub fn master_host(&self, partition: PartitionId) -> HostId {
        HostId(partition.0 % self.host_num)
    }

    /// Returns true if `host` owns `partition`.
    #[inline]
    pub fn is_local(&self, host: HostId, partition: PartitionId) -> bool {
        self.master_host(partition) == host
    }

    /// Returns the partitions owned by a host in ascending order.
    pub fn partitions_of(&self, host: HostId) -> Vec<PartitionId> {
        (0..self.partition_num)
            .map(PartitionId)
            .filter(|p| self.master_host(*p) == host)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(TableId(3).to_string(), "t3");
        assert_eq!(PartitionId(12).to_string(), "p12");
        assert_eq!(HostId(1).to_string(), "h1");
        assert_eq!(WorkerId(7).to_string(), "w7");
    }

    #[test]
    fn test_leader() {
        assert!(HostId(0).is_leader());
        assert!(!HostId(2).is_leader());
    }

    #[test]
    fn test_partitioner_striping() {
        let p = Partitioner::new(2, 6);
        assert_eq!(p.master_host(PartitionId(0)), HostId(0));
        assert_eq!(p.master_host(PartitionId(1)), HostId(1));
        assert_eq!(p.master_host(PartitionId(4)), HostId(0));
        assert!(p.is_local(HostId(1), PartitionId(5)));
        assert_eq!(
            p.partitions_of(HostId(1)),
            vec![PartitionId(1), PartitionId(3), PartitionId(5)]
        );
    }

    #[test]
    #[should_panic(expected = "at least one partition")]
    fn test_partitioner_rejects_idle_hosts() {
        Partitioner::new(4, 2);
    }
}
