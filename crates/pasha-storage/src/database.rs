//! Per-host catalogue of table partitions.

use crate::ordered::OrderedTable;
use crate::table::{Table, TableKind};
use crate::unordered::UnorderedTable;
use parking_lot::RwLock;
use pasha_common::{HostId, PartitionId, Partitioner, PashaError, Result, TableId};
use std::collections::HashMap;
use std::sync::Arc;

/// Table definition shared by every partition of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDef {
    pub table_id: TableId,
    pub kind: TableKind,
    pub value_size: usize,
}

/// The partitions one host owns.
pub struct Database {
    host: HostId,
    partitioner: Partitioner,
    tables: RwLock<HashMap<(TableId, PartitionId), Arc<dyn Table>>>,
}

impl Database {
    pub fn new(host: HostId, partitioner: Partitioner) -> Self {
        Self {
            host,
            partitioner,
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> HostId {
        self.host
    }

    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    /// Creates one partition of a table on this host.
    pub fn create_table(&self, def: TableDef, partition: PartitionId) -> Result<Arc<dyn Table>> {
        if !self.partitioner.is_local(self.host, partition) {
            return Err(PashaError::InvalidParameter {
                name: "partition".to_string(),
                value: format!("{partition} is owned by {}", self.partitioner.master_host(partition)),
            });
        }
        let mut tables = self.tables.write();
        if tables.contains_key(&(def.table_id, partition)) {
            return Err(PashaError::TableAlreadyExists {
                table_id: def.table_id.0,
                partition_id: partition.0,
            });
        }
        let table: Arc<dyn Table> = match def.kind {
            TableKind::Ordered => Arc::new(OrderedTable::new(def.table_id, partition, def.value_size)),
            TableKind::Unordered => Arc::new(UnorderedTable::new(def.table_id, partition, def.value_size)),
        };
        tables.insert((def.table_id, partition), Arc::clone(&table));
        Ok(table)
    }

    /// Creates the table on every partition this host owns.
    pub fn create_local_partitions(&self, def: TableDef) -> Result<()> {
        for p in self.partitioner.partitions_of(self.host) {
            self.create_table(def, p)?;
        }
        Ok(())
    }

    pub fn find_table(&self, table: TableId, partition: PartitionId) -> Result<Arc<dyn Table>> {
        self.tables
            .read()
            .get(&(table, partition))
            .cloned()
            .ok_or(PashaError::TableNotFound {
                table_id: table.0,
                partition_id: partition.0,
            })
    }

    pub fn tables(&self) -> Vec<Arc<dyn Table>> {
        let mut all: Vec<_> = self.tables.read().values().cloned().collect();
        all.sort_by_key(|t| (t.table_id(), t.partition_id()));
        all
    }
}
