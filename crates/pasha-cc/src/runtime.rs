//! Cluster bootstrap and per-host runtime.
//!
//! Every host shares one CXL pool. The leader carves the shared-region
//! index and the reclamation state out of it and publishes them through
//! the pool's root table; the other hosts attach. Each host then owns its
//! partitions, a migration manager and a logger, and hands out
//! [`WorkerCore`]s that run transactions and serve remote requests.

use crate::executor::WorkerCore;
use crate::helper::TwoPlPashaHelper;
use crate::migration::{create_migration_manager, MigrationManager, MigrationResult};
use crate::transport::Transport;
use parking_lot::RwLock;
use pasha_common::{
    HostId, Key, PartitionId, Partitioner, PashaConfig, PashaError, PreMigrate, Result, TableId,
    WorkerId,
};
use pasha_cxl::{create_scc_manager, CxlPool, CxlPoolConfig, Ebr, SharedIndex, ROOT_INIT_DONE};
use pasha_storage::{Database, TableDef, TableKind};
use pasha_wal::{Logger, NullLogger, WalWriter, WalWriterConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How long a follower waits for the leader to publish the shared roots.
const ATTACH_TIMEOUT: Duration = Duration::from_secs(5);

/// One host: its partitions and everything its workers share.
pub struct HostRuntime {
    pub(crate) config: Arc<PashaConfig>,
    pub(crate) host: HostId,
    pub(crate) database: Database,
    pub(crate) helper: Arc<TwoPlPashaHelper>,
    pub(crate) migration: Arc<dyn MigrationManager>,
    pub(crate) logger: Arc<dyn Logger>,
    pub(crate) transport: Arc<Transport>,
    defs: RwLock<HashMap<TableId, TableDef>>,
}

impl HostRuntime {
    fn start(
        config: Arc<PashaConfig>,
        host: HostId,
        pool: Arc<CxlPool>,
        transport: Arc<Transport>,
    ) -> Result<Self> {
        let index = SharedIndex::attach(&pool, ATTACH_TIMEOUT)?;
        let ebr = Ebr::attach(&pool, ATTACH_TIMEOUT)?;
        let helper = Arc::new(TwoPlPashaHelper::new(
            host,
            pool,
            index,
            create_scc_manager(config.scc_mechanism),
            ebr,
            &config,
        ));
        let migration =
            create_migration_manager(&config, Arc::clone(&helper), config.hw_cc_budget_per_host());
        let logger: Arc<dyn Logger> = match WalWriterConfig::for_host(&config, host.0) {
            Some(wal) => Arc::new(WalWriter::new(wal)?),
            None => Arc::new(NullLogger::new()),
        };
        let partitioner = Partitioner::new(config.coordinator_num, config.partition_num);
        info!(%host, partitions = ?partitioner.partitions_of(host), "host started");
        Ok(Self {
            database: Database::new(host, partitioner),
            config,
            host,
            helper,
            migration,
            logger,
            transport,
            defs: RwLock::new(HashMap::new()),
        })
    }

    #[inline]
    pub fn host(&self) -> HostId {
        self.host
    }

    pub fn config(&self) -> &PashaConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn helper(&self) -> &Arc<TwoPlPashaHelper> {
        &self.helper
    }

    pub fn migration(&self) -> &Arc<dyn MigrationManager> {
        &self.migration
    }

    pub fn pool(&self) -> &Arc<CxlPool> {
        self.helper.pool()
    }

    /// Host owning `partition`.
    #[inline]
    pub fn owner_of(&self, partition: PartitionId) -> HostId {
        self.database.partitioner().master_host(partition)
    }

    #[inline]
    pub fn is_local(&self, partition: PartitionId) -> bool {
        self.database.partitioner().is_local(self.host, partition)
    }

    /// Kind of a table known to the cluster, wherever its partitions live.
    pub fn table_kind(&self, table: TableId) -> Option<TableKind> {
        self.defs.read().get(&table).map(|d| d.kind)
    }

    fn create_table(&self, def: TableDef) -> Result<()> {
        self.database.create_local_partitions(def)?;
        self.defs.write().insert(def.table_id, def);
        Ok(())
    }

    /// Moves every row of the selected tables into the shared region.
    fn pre_migrate(&self, non_partitioned: &[TableId]) -> Result<usize> {
        let mut moved = 0;
        for table in self.database.tables() {
            let wanted = match self.config.pre_migrate {
                PreMigrate::None => false,
                PreMigrate::All => true,
                PreMigrate::NonPart => non_partitioned.contains(&table.table_id()),
            };
            if !wanted {
                continue;
            }
            for key in table.keys() {
                match self.migration.move_row_in(&table, key, false) {
                    MigrationResult::Success(_) => moved += 1,
                    MigrationResult::AlreadyInShared(_) | MigrationResult::NotFound => {}
                    MigrationResult::OutOfMemory => {
                        return Err(PashaError::MigrationFailed {
                            table_id: table.table_id().0,
                            partition_id: table.partition_id().0,
                            key,
                            reason: "shared region full during pre-migration".to_string(),
                        })
                    }
                }
            }
        }
        debug!(host = %self.host, moved, "pre-migration done");
        Ok(moved)
    }
}

impl std::fmt::Debug for HostRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRuntime")
            .field("host", &self.host)
            .field("policy", &self.migration.policy())
            .finish_non_exhaustive()
    }
}

/// Every host of a deployment, sharing one pool.
pub struct Cluster {
    config: Arc<PashaConfig>,
    pool: Arc<CxlPool>,
    hosts: Vec<Arc<HostRuntime>>,
}

impl Cluster {
    /// Validates the configuration, initializes the shared region from the
    /// leader and starts every host.
    pub fn new(config: PashaConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let pool = Arc::new(CxlPool::new(CxlPoolConfig {
            capacity_bytes: config.cxl_pool_bytes,
            row_slots: config.max_shared_rows,
        }));

        SharedIndex::create_and_publish(&pool, config.index_bucket_count)?;
        Ebr::create_and_publish(&pool, config.total_workers(), config.ebr_advance_threshold)?;
        pool.set_root(ROOT_INIT_DONE, 1);

        let transport = Arc::new(Transport::new(config.coordinator_num, config.worker_num));
        let hosts = (0..config.coordinator_num)
            .map(|h| {
                pool.wait_for_root(ROOT_INIT_DONE, ATTACH_TIMEOUT)?;
                HostRuntime::start(
                    Arc::clone(&config),
                    HostId(h),
                    Arc::clone(&pool),
                    Arc::clone(&transport),
                )
                .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        info!(
            hosts = config.coordinator_num,
            workers = config.worker_num,
            partitions = config.partition_num,
            policy = %config.migration_policy,
            "cluster ready"
        );
        Ok(Self { config, pool, hosts })
    }

    pub fn config(&self) -> &PashaConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<CxlPool> {
        &self.pool
    }

    /// # Panics
    ///
    /// Panics if the host does not exist.
    pub fn host(&self, host: HostId) -> &Arc<HostRuntime> {
        &self.hosts[host.index()]
    }

    pub fn hosts(&self) -> &[Arc<HostRuntime>] {
        &self.hosts
    }

    /// Creates every partition of a table, each on its owner.
    pub fn create_table(&self, def: TableDef) -> Result<()> {
        for host in &self.hosts {
            host.create_table(def)?;
        }
        Ok(())
    }

    /// Loads a committed row into its owner partition.
    pub fn load_row(&self, table: TableId, partition: PartitionId, key: Key, value: &[u8]) -> Result<()> {
        let owner = self.hosts[0].owner_of(partition);
        let table = self.host(owner).database.find_table(table, partition)?;
        match table.insert(key, value, false) {
            Some(_) => Ok(()),
            None => Err(PashaError::InvalidParameter {
                name: "key".to_string(),
                value: format!("{key} already loaded into {}/{partition}", table.table_id()),
            }),
        }
    }

    /// Runs the configured pre-migration on every host. `non_partitioned`
    /// lists the tables `PreMigrate::NonPart` applies to.
    pub fn pre_migrate(&self, non_partitioned: &[TableId]) -> Result<usize> {
        let mut moved = 0;
        for host in &self.hosts {
            moved += host.pre_migrate(non_partitioned)?;
        }
        Ok(moved)
    }

    /// Builds the `local`-th worker of a host.
    pub fn worker(&self, host: HostId, local: u32) -> WorkerCore {
        let host = Arc::clone(self.host(host));
        let id = host.transport.worker_id(host.host, local);
        WorkerCore::new(host, id)
    }

    /// Frees everything still waiting for reclamation. Workers must have
    /// stopped.
    pub fn shutdown(&self) {
        let ebr = self.hosts[0].helper.ebr();
        for w in 0..self.config.total_workers() as u32 {
            ebr.drain(WorkerId(w), |obj| self.pool.free_raw(obj.raw, obj.category));
        }
        info!(pool_used = self.pool.used_bytes(), "cluster shut down");
    }
}
