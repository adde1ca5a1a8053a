//! Configuration structures for Pasha.

use crate::error::{PashaError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Cluster-wide configuration consumed by the concurrency control core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PashaConfig {
    /// Number of hosts (coordinators) sharing the CXL pool.
    pub coordinator_num: u32,
    /// Number of worker threads per host.
    pub worker_num: u32,
    /// Total number of data partitions across the cluster.
    pub partition_num: u32,
    /// Which tuples enter the shared region and which leave first.
    pub migration_policy: MigrationPolicyKind,
    /// When migrated tuples are moved back out.
    pub when_to_move_out: MoveOutTiming,
    /// Byte budget for hardware cache-coherent memory (index plus metadata).
    pub hw_cc_budget: u64,
    /// Memory reserved for retired objects awaiting reclamation.
    pub max_ebr_retiring_memory: u64,
    /// Lock the next key on inserts, deletes and scans.
    pub enable_phantom_detection: bool,
    /// Coherence discipline for shared tuple bytes.
    pub scc_mechanism: SccMechanism,
    /// Skip copying bytes across the migration boundary when they are current.
    pub enable_migration_optimization: bool,
    /// Tables moved into the shared region at startup.
    pub pre_migrate: PreMigrate,
    /// Total capacity of the CXL pool in bytes.
    pub cxl_pool_bytes: u64,
    /// Number of shared tuple slots in the pool arena.
    pub max_shared_rows: usize,
    /// Number of buckets in the shared-region index (power of two).
    pub index_bucket_count: usize,
    /// Retired objects per epoch before a worker tries to advance the global epoch.
    pub ebr_advance_threshold: usize,
    /// Remote wait limit in milliseconds (0 = wait forever).
    pub remote_wait_timeout_ms: u64,
    /// Directory for redo log segments (None = logging disabled).
    pub wal_dir: Option<PathBuf>,
    /// Sync redo records before locks are released.
    pub persist_log: bool,
}

impl Default for PashaConfig {
    fn default() -> Self {
        Self {
            coordinator_num: 2,
            worker_num: 2,
            partition_num: 4,
            migration_policy: MigrationPolicyKind::Eagerly,
            when_to_move_out: MoveOutTiming::Reactive,
            hw_cc_budget: 256 * 1024 * 1024, // 256 MB
            max_ebr_retiring_memory: 16 * 1024 * 1024, // 16 MB
            enable_phantom_detection: true,
            scc_mechanism: SccMechanism::NoOp,
            enable_migration_optimization: true,
            pre_migrate: PreMigrate::None,
            cxl_pool_bytes: 1024 * 1024 * 1024, // 1 GB
            max_shared_rows: 1 << 16,
            index_bucket_count: 1 << 14,
            ebr_advance_threshold: 1024,
            remote_wait_timeout_ms: 0,
            wal_dir: None,
            persist_log: false,
        }
    }
}

impl PashaConfig {
    /// Returns the per-host byte budget for migrated tuples.
    pub fn hw_cc_budget_per_host(&self) -> u64 {
        self.hw_cc_budget.saturating_sub(self.max_ebr_retiring_memory) / self.coordinator_num.max(1) as u64
    }

    /// Returns the total number of workers across all hosts.
    pub fn total_workers(&self) -> usize {
        (self.coordinator_num * self.worker_num) as usize
    }

    /// Checks the configuration for inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.coordinator_num == 0 {
            return Err(invalid("coordinator_num", self.coordinator_num));
        }
        if self.coordinator_num > 32 {
            // WriteThrough keeps one coherence bit per host in a u32
            return Err(PashaError::ConfigError(format!(
                "at most 32 hosts supported, got {}",
                self.coordinator_num
            )));
        }
        if self.worker_num == 0 {
            return Err(invalid("worker_num", self.worker_num));
        }
        if self.partition_num < self.coordinator_num {
            return Err(PashaError::ConfigError(format!(
                "partition_num {} smaller than coordinator_num {}",
                self.partition_num, self.coordinator_num
            )));
        }
        if !self.index_bucket_count.is_power_of_two() {
            return Err(invalid("index_bucket_count", self.index_bucket_count));
        }
        if self.max_shared_rows == 0 || self.max_shared_rows > u32::MAX as usize {
            return Err(invalid("max_shared_rows", self.max_shared_rows));
        }
        if self.ebr_advance_threshold == 0 {
            return Err(invalid("ebr_advance_threshold", self.ebr_advance_threshold));
        }
        if self.max_ebr_retiring_memory >= self.hw_cc_budget {
            return Err(PashaError::ConfigError(format!(
                "hw_cc_budget {} does not cover max_ebr_retiring_memory {}",
                self.hw_cc_budget, self.max_ebr_retiring_memory
            )));
        }
        if self.persist_log && self.wal_dir.is_none() {
            return Err(PashaError::ConfigError(
                "persist_log requires wal_dir".to_string(),
            ));
        }
        Ok(())
    }
}

fn invalid(name: &str, value: impl ToString) -> PashaError {
    PashaError::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}

macro_rules! textual_enum {
    ($name:ident, $param:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Returns the textual name accepted by `from_str`.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = PashaError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(invalid($param, other)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Migration policy deciding residency in the shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MigrationPolicyKind {
    /// Migrate on first remote touch, evict every unreferenced tuple when over budget.
    #[default]
    Eagerly,
    /// Evict in arrival order until usage drops below the budget.
    OnDemandFifo,
    /// Evict the least recently accessed tuples first.
    Lru,
    /// Second-chance eviction over a reference-bit ring.
    Clock,
    /// Never evict.
    NoMoveOut,
}

textual_enum!(MigrationPolicyKind, "migration_policy", {
    Eagerly => "Eagerly",
    OnDemandFifo => "OnDemandFIFO",
    Lru => "LRU",
    Clock => "Clock",
    NoMoveOut => "NoMoveOut",
});

/// When migrated tuples are considered for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MoveOutTiming {
    /// On move-out hints sent by remote hosts after they finish a transaction.
    #[default]
    Reactive,
    /// Right after serving a migration request.
    OnDemand,
}

textual_enum!(MoveOutTiming, "when_to_move_out", {
    Reactive => "Reactive",
    OnDemand => "OnDemand",
});

/// Software cache-coherence discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SccMechanism {
    /// Plain copies; the fabric is coherent.
    #[default]
    NoOp,
    /// Flush before every read, write back after every write.
    NonTemporal,
    /// Per-host coherence bitmap, flush only on a miss.
    WriteThrough,
}

textual_enum!(SccMechanism, "scc_mechanism", {
    NoOp => "NoOP",
    NonTemporal => "NonTemporal",
    WriteThrough => "WriteThrough",
});

/// Tables migrated into the shared region at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PreMigrate {
    /// Nothing is migrated ahead of time.
    #[default]
    None,
    /// Every row of every table.
    All,
    /// Every row of tables registered as non-partitioned.
    NonPart,
}

textual_enum!(PreMigrate, "pre_migrate", {
    None => "None",
    All => "All",
    NonPart => "NonPart",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = PashaConfig::default();
        assert_eq!(config.coordinator_num, 2);
        assert_eq!(config.worker_num, 2);
        assert_eq!(config.partition_num, 4);
        assert_eq!(config.migration_policy, MigrationPolicyKind::Eagerly);
        assert_eq!(config.when_to_move_out, MoveOutTiming::Reactive);
        assert_eq!(config.scc_mechanism, SccMechanism::NoOp);
        assert_eq!(config.pre_migrate, PreMigrate::None);
        assert!(config.enable_phantom_detection);
        assert!(config.enable_migration_optimization);
        assert!(config.wal_dir.is_none());
        assert!(!config.persist_log);
        config.validate().unwrap();
    }

    #[test]
    fn test_budget_per_host() {
        let config = PashaConfig {
            hw_cc_budget: 1000,
            max_ebr_retiring_memory: 200,
            coordinator_num: 4,
            partition_num: 4,
            ..Default::default()
        };
        assert_eq!(config.hw_cc_budget_per_host(), 200);
        assert_eq!(config.total_workers(), 8);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let config = PashaConfig {
            index_bucket_count: 1000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PashaError::InvalidParameter { .. })
        ));

        let config = PashaConfig {
            coordinator_num: 4,
            partition_num: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PashaError::ConfigError(_))));

        let config = PashaConfig {
            persist_log: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PashaConfig {
            coordinator_num: 33,
            partition_num: 64,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enum_from_str() {
        assert_eq!(
            "OnDemandFIFO".parse::<MigrationPolicyKind>().unwrap(),
            MigrationPolicyKind::OnDemandFifo
        );
        assert_eq!("LRU".parse::<MigrationPolicyKind>().unwrap(), MigrationPolicyKind::Lru);
        assert_eq!("OnDemand".parse::<MoveOutTiming>().unwrap(), MoveOutTiming::OnDemand);
        assert_eq!("NoOP".parse::<SccMechanism>().unwrap(), SccMechanism::NoOp);
        assert_eq!("NonPart".parse::<PreMigrate>().unwrap(), PreMigrate::NonPart);

        let err = "Random".parse::<MigrationPolicyKind>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid parameter: migration_policy = Random");
    }

    #[test]
    fn test_enum_display_matches_parse() {
        for kind in [
            MigrationPolicyKind::Eagerly,
            MigrationPolicyKind::OnDemandFifo,
            MigrationPolicyKind::Lru,
            MigrationPolicyKind::Clock,
            MigrationPolicyKind::NoMoveOut,
        ] {
            assert_eq!(kind.to_string().parse::<MigrationPolicyKind>().unwrap(), kind);
        }
        assert_eq!(SccMechanism::WriteThrough.to_string(), "WriteThrough");
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let original = PashaConfig {
            migration_policy: MigrationPolicyKind::Clock,
            scc_mechanism: SccMechanism::WriteThrough,
            wal_dir: Some(PathBuf::from("/tmp/pasha-wal")),
            ..Default::default()
        };
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: PashaConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(deserialized.migration_policy, MigrationPolicyKind::Clock);
        assert_eq!(deserialized.scc_mechanism, SccMechanism::WriteThrough);
        assert_eq!(deserialized.wal_dir, original.wal_dir);
        assert_eq!(deserialized.hw_cc_budget, original.hw_cc_budget);
    }
}
