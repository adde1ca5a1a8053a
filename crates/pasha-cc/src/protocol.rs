//! Two-phase locking across partitions and the shared region.
//!
//! Requester side: responses from owners are folded into the key sets,
//! and an attempt is committed or aborted. Owner side: migration, scan,
//! insert, delete and move-out requests are served against this host's
//! partitions.
//!
//! Commit order:
//! 1. pick a timestamp above every version read and every earlier commit
//! 2. log every modified tuple
//! 3. write back, validate inserts, remove deleted tuples
//! 4. release locks, stamping written tuples with the timestamp
//! 5. drop reference counts, then notify owners

use crate::executor::{collect_range, range_unchanged, WorkerCore};
use crate::helper::{NextKeyLock, TwoPlPashaHelper};
use crate::message::{Envelope, MigrationStatus, Request, Response, ScanStatus};
use crate::migration::MigrationResult;
use crate::runtime::HostRuntime;
use crate::rwkey::{LockMode, RowTarget, ScanRow, SharedRowRef};
use crate::transaction::{AbortReason, TxnOutcome, TxnState};
use bytes::Bytes;
use pasha_common::{HostId, Key, MoveOutTiming, PartitionId, Result, TableId, Tid, WorkerId};
use pasha_cxl::{SharedHandle, SharedRow};
use pasha_storage::{LocalRow, Table, TableKind};
use pasha_wal::{RedoOp, RedoPayload};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// A tuple removed on its owner once the requester's transaction ends.
type RemoteDelete = (HostId, TableId, PartitionId, Key);

/// Deleted tuples by delete-set index, with their table when this host
/// owns them.
type DeleteTables = Vec<(usize, Option<Arc<dyn Table>>)>;

fn release_target(helper: &TwoPlPashaHelper, target: &RowTarget, mode: LockMode, commit_tid: Option<Tid>) {
    match target {
        RowTarget::Local(row) => helper.release_lock(row, mode, commit_tid),
        RowTarget::Shared(guard) => helper.remote_release_lock(guard.handle(), mode, commit_tid),
    }
}

impl WorkerCore {
    // -------------------------------------------------------------------------
    // Responses
    // -------------------------------------------------------------------------

    /// Folds an owner's response into the current attempt. Responses to a
    /// finished attempt are undone instead.
    pub(crate) fn handle_response(&mut self, envelope: Envelope<Response>) -> Result<()> {
        let Envelope { from, txn_id, body } = envelope;
        if txn_id != self.txn.id() || self.txn.state() != TxnState::Active {
            self.stats.stale_responses += 1;
            debug!(worker = %self.id, %from, txn = txn_id, "stale response");
            return self.undo_stale_response(body);
        }
        self.txn.pending_responses = self.txn.pending_responses.saturating_sub(1);
        let pool = Arc::clone(self.host.helper.pool());
        let helper = Arc::clone(&self.host.helper);

        match body {
            Response::DataMigration { slot, status, handle } => {
                self.txn.read_set[slot].processed = true;
                match (status, handle) {
                    (MigrationStatus::Migrated, Some(handle)) => {
                        let guard = SharedRowRef::adopt(pool, handle);
                        let mode = self.txn.read_set[slot].mode;
                        match helper.remote_take_lock_and_read(handle, mode, false) {
                            Some((tid, value)) => {
                                self.host.migration.access_row(handle);
                                self.txn.read_set[slot].grant(tid, value, RowTarget::Shared(guard));
                            }
                            None => self.txn.abort_lock = true,
                        }
                    }
                    (MigrationStatus::OutOfMemory, _) => self.txn.abort_migration = true,
                    _ => self.txn.abort_lock = true,
                }
            }
            Response::DataMigrationForScan {
                slot,
                status,
                rows,
                next,
                row_mode,
                next_mode,
            } => {
                self.txn.scan_set[slot].processed = true;
                match status {
                    ScanStatus::Granted => {}
                    ScanStatus::Conflict => {
                        self.txn.abort_lock = true;
                        return Ok(());
                    }
                    ScanStatus::OutOfMemory => {
                        self.txn.abort_migration = true;
                        return Ok(());
                    }
                }
                let mut bits = Vec::with_capacity(rows.len());
                for (key, handle) in rows {
                    let (tid, value, real) = helper.remote_read_locked(handle);
                    bits.push(real);
                    self.txn.scan_set[slot].rows.push(ScanRow {
                        key,
                        value,
                        tid,
                        mode: row_mode,
                        dirty: false,
                        target: RowTarget::Shared(SharedRowRef::adopt(Arc::clone(&pool), handle)),
                    });
                }
                if let (Some((key, handle)), Some(mode)) = (next, next_mode) {
                    let (tid, _, real) = helper.remote_read_locked(handle);
                    bits.push(real);
                    self.txn.scan_set[slot].next_row = Some(ScanRow {
                        key,
                        value: Bytes::new(),
                        tid,
                        mode,
                        dirty: false,
                        target: RowTarget::Shared(SharedRowRef::adopt(Arc::clone(&pool), handle)),
                    });
                }
                // Consecutive migrated keys must know each other; otherwise
                // a key between them never reached the shared region.
                let gap = bits.windows(2).any(|w| !w[0].1 || !w[1].0);
                if gap {
                    debug!(worker = %self.id, slot, "scan range has a hole in the shared region");
                    self.txn.abort_lock = true;
                }
                for row in &self.txn.scan_set[slot].rows {
                    if let RowTarget::Shared(guard) = &row.target {
                        self.host.migration.access_row(guard.handle());
                    }
                }
            }
            Response::RemoteInsert { slot, handle } => {
                let ins = &mut self.txn.insert_set[slot];
                ins.processed = true;
                match handle {
                    Some(handle) => ins.target = Some(RowTarget::Shared(SharedRowRef::adopt(pool, handle))),
                    None => self.txn.abort_insert = true,
                }
            }
        }
        Ok(())
    }

    fn undo_stale_response(&mut self, body: Response) -> Result<()> {
        let helper = Arc::clone(&self.host.helper);
        match body {
            Response::DataMigration { handle, .. } => {
                if let Some(handle) = handle {
                    helper.release_migrated_row(handle);
                }
            }
            Response::DataMigrationForScan {
                status: ScanStatus::Granted,
                rows,
                next,
                row_mode,
                next_mode,
                ..
            } => {
                for (_, handle) in &rows {
                    helper.remote_release_lock(*handle, row_mode, None);
                }
                if let (Some((_, handle)), Some(mode)) = (&next, next_mode) {
                    helper.remote_release_lock(*handle, mode, None);
                }
                for (_, handle) in rows.iter().chain(next.iter()) {
                    helper.release_migrated_row(*handle);
                }
            }
            Response::DataMigrationForScan { .. } => {}
            Response::RemoteInsert { handle, .. } => {
                if let Some(handle) = handle {
                    let owner = self.host.pool().resolve_row(handle).lock().owner;
                    helper.release_migrated_row(handle);
                    if let Some(region_key) = owner {
                        let host = self.host.owner_of(region_key.partition);
                        self.send(
                            host,
                            Request::RemoteDelete {
                                table: region_key.table,
                                partition: region_key.partition,
                                key: region_key.plain_key,
                            },
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Commit
    // -------------------------------------------------------------------------

    fn generate_tid(&self) -> Tid {
        let reads = self
            .txn
            .read_set
            .iter()
            .filter(|k| k.granted && !k.local_index_read)
            .map(|k| k.tid);
        let scans = self.txn.scan_set.iter().flat_map(|s| s.rows.iter().map(|r| r.tid));
        reads.chain(scans).fold(self.max_tid, Tid::max) + 1
    }

    fn log_redo(&self, tid: Tid) -> Result<()> {
        let txn = &self.txn;
        let mut payloads = Vec::new();
        for w in &txn.write_set {
            let (table, partition, key, _) = txn.row_at(w.loc);
            payloads.push(RedoPayload {
                op: RedoOp::Write,
                table,
                partition,
                key,
                tid,
                value: w.value.clone(),
            });
        }
        for ins in txn.insert_set.iter().filter(|k| k.target.is_some()) {
            payloads.push(RedoPayload {
                op: RedoOp::Insert,
                table: ins.table,
                partition: ins.partition,
                key: ins.key,
                tid,
                value: ins.value.clone(),
            });
        }
        for del in &txn.delete_set {
            payloads.push(RedoPayload {
                op: RedoOp::Delete,
                table: del.table,
                partition: del.partition,
                key: del.key,
                tid,
                value: Bytes::new(),
            });
        }

        let persist = self.host.config.persist_log;
        let mut last = None;
        for payload in &payloads {
            last = Some(self.host.logger.write(&payload.encode(), false, txn.start())?);
        }
        if let (true, Some(lsn)) = (persist, last) {
            self.host.logger.sync(lsn)?;
        }
        Ok(())
    }

    /// Commits the current attempt. Every key must be granted.
    pub(crate) fn commit(&mut self) -> Result<TxnOutcome> {
        self.txn.transition(TxnState::Committing);
        let local_deletes = match self.resolve_local_deletes() {
            Ok(tables) => tables,
            Err(e) => return Err(self.abort_with_error(e)),
        };
        let tid = self.generate_tid();
        if let Err(e) = self.log_redo(tid) {
            warn!(worker = %self.id, txn = self.txn.id(), error = %e, "redo logging failed");
            return Err(self.abort_with_error(e));
        }
        self.txn.commit_tid = Some(tid);
        let helper = Arc::clone(&self.host.helper);

        for w in &self.txn.write_set {
            match self.txn.row_at(w.loc).3 {
                Some(RowTarget::Local(row)) => helper.update(row, &w.value),
                Some(RowTarget::Shared(guard)) => helper.remote_update(guard.handle(), &w.value),
                None => panic!("write to {:?} without a lock", w.loc),
            }
        }
        let written: Vec<_> = self.txn.write_set.iter().map(|w| w.loc).collect();
        for loc in written {
            self.txn.mark_dirty(loc);
        }

        for ins in &self.txn.insert_set {
            match &ins.target {
                Some(RowTarget::Local(row)) => helper.modify_tuple_valid_bit(row, true),
                Some(RowTarget::Shared(guard)) => helper.remote_modify_tuple_valid_bit(guard.handle(), true),
                None => {}
            }
        }

        let mut remote_deletes = Vec::new();
        for (d, table) in local_deletes {
            let del = &self.txn.delete_set[d];
            match table {
                Some(table) => {
                    self.host
                        .migration
                        .delete_specific_row_and_move_out(self.id, &table, del.key, true);
                }
                None => {
                    if let Some(RowTarget::Shared(guard)) = self.txn.row_at(del.loc).3 {
                        helper.remote_modify_tuple_valid_bit(guard.handle(), false);
                    }
                    remote_deletes.push((self.host.owner_of(del.partition), del.table, del.partition, del.key));
                }
            }
        }

        self.release_locks(Some(tid));
        for ins in &self.txn.insert_set {
            if let Some(target) = &ins.target {
                release_target(&helper, target, LockMode::Write, Some(tid));
            }
        }
        self.txn.release_references();
        self.notify_owners(remote_deletes);

        self.txn.transition(TxnState::Committed);
        self.max_tid = tid;
        self.stats.committed += 1;
        trace!(worker = %self.id, txn = self.txn.id(), tid, "committed");
        Ok(TxnOutcome::Committed { commit_tid: tid })
    }

    fn resolve_local_deletes(&self) -> Result<DeleteTables> {
        self.txn
            .delete_set
            .iter()
            .enumerate()
            .map(|(d, del)| {
                if self.host.is_local(del.partition) {
                    Ok((d, Some(self.host.database.find_table(del.table, del.partition)?)))
                } else {
                    Ok((d, None))
                }
            })
            .collect()
    }

    /// Releases read, scan and next-key locks. Rows written by this
    /// attempt get `commit_tid` as their new version.
    fn release_locks(&mut self, commit_tid: Option<Tid>) {
        let helper = Arc::clone(&self.host.helper);
        for k in &self.txn.read_set {
            if let (true, Some(target)) = (k.granted, &k.target) {
                release_target(&helper, target, k.mode, if k.dirty { commit_tid } else { None });
            }
        }
        for scan in &self.txn.scan_set {
            for row in &scan.rows {
                release_target(&helper, &row.target, row.mode, if row.dirty { commit_tid } else { None });
            }
            if let Some(row) = &scan.next_row {
                release_target(&helper, &row.target, row.mode, None);
            }
        }
        for ins in &mut self.txn.insert_set {
            if let Some(next) = ins.next_row.take() {
                helper.release_lock(&next, LockMode::Write, None);
            }
        }
    }

    fn notify_owners(&mut self, remote_deletes: Vec<RemoteDelete>) {
        for (owner, table, partition, key) in remote_deletes {
            if let Err(e) = self.send(owner, Request::RemoteDelete { table, partition, key }) {
                warn!(worker = %self.id, %owner, error = %e, "remote delete not sent");
            }
        }
        if self.host.migration.when_to_move_out() != MoveOutTiming::Reactive {
            return;
        }
        let hints: Vec<(HostId, Vec<PartitionId>)> = std::mem::take(&mut self.txn.remote_partitions)
            .into_iter()
            .map(|(owner, partitions)| (owner, partitions.into_iter().collect()))
            .collect();
        for (owner, partitions) in hints {
            if let Err(e) = self.send(owner, Request::MoveOutHint { partitions }) {
                warn!(worker = %self.id, %owner, error = %e, "move-out hint not sent");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Abort
    // -------------------------------------------------------------------------

    /// Undoes the current attempt: removes its placeholders, releases its
    /// locks without changing versions and drops its reference counts.
    pub(crate) fn abort(&mut self, reason: AbortReason) -> Result<()> {
        self.txn.transition(TxnState::Aborting);
        debug!(worker = %self.id, txn = self.txn.id(), %reason, "abort");
        let mut first_error = None;
        let mut remote_deletes = Vec::new();
        let mut placeholders: Vec<(TableId, PartitionId, Key, Arc<LocalRow>)> = Vec::new();

        for ins in &mut self.txn.insert_set {
            match ins.target.take() {
                Some(RowTarget::Local(row)) => placeholders.push((ins.table, ins.partition, ins.key, row)),
                // The owner removes the placeholder together with its lock.
                Some(RowTarget::Shared(guard)) => {
                    drop(guard);
                    remote_deletes.push((self.host.owner_of(ins.partition), ins.table, ins.partition, ins.key));
                }
                None => {}
            }
        }
        for (table, partition, key, row) in placeholders {
            match self.host.database.find_table(table, partition) {
                Ok(table) => {
                    self.host
                        .migration
                        .delete_specific_row_and_move_out(self.id, &table, key, true);
                }
                Err(e) => {
                    self.host.helper.release_lock(&row, LockMode::Write, None);
                    first_error.get_or_insert(e);
                }
            }
        }

        self.release_locks(None);
        self.txn.release_references();
        self.notify_owners(remote_deletes);

        self.txn.transition(TxnState::Aborted);
        self.stats.aborted += 1;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// -----------------------------------------------------------------------------
// Owner side
// -----------------------------------------------------------------------------

/// Rows of a remote scan and its next key, locked on the requester's
/// behalf.
type GrantedRange = (Vec<GrantedRow>, Option<GrantedRow>);

/// A tuple locked on a requester's behalf while serving a scan.
struct GrantedRow {
    key: Key,
    row: Arc<LocalRow>,
    handle: SharedHandle<SharedRow>,
    mode: LockMode,
}

impl HostRuntime {
    /// Serves one request from another host on worker `worker`.
    pub fn serve_request(&self, worker: WorkerId, envelope: Envelope<Request>) -> Result<()> {
        let Envelope { from, txn_id, body } = envelope;
        let reply = |body: Response| {
            self.transport.send_response(
                from,
                Envelope {
                    from: worker,
                    txn_id,
                    body,
                },
            )
        };

        match body {
            Request::DataMigration {
                table,
                partition,
                key,
                slot,
            } => {
                let (status, handle) = self.migrate_for_remote(table, partition, key);
                if let Err(e) = reply(Response::DataMigration { slot, status, handle }) {
                    if let Some(handle) = handle {
                        self.helper.release_migrated_row(handle);
                    }
                    return Err(e);
                }
                self.move_out_on_demand(worker, partition);
            }
            Request::DataMigrationForScan {
                table,
                partition,
                min_key,
                max_key,
                limit,
                row_mode,
                next_mode,
                slot,
            } => {
                let granted =
                    self.lock_range_for_remote(table, partition, min_key, max_key, limit, row_mode, next_mode);
                let response = match &granted {
                    Ok((rows, next)) => Response::DataMigrationForScan {
                        slot,
                        status: ScanStatus::Granted,
                        rows: rows.iter().map(|g| (g.key, g.handle)).collect(),
                        next: next.as_ref().map(|g| (g.key, g.handle)),
                        row_mode,
                        next_mode,
                    },
                    Err(status) => Response::DataMigrationForScan {
                        slot,
                        status: *status,
                        rows: Vec::new(),
                        next: None,
                        row_mode,
                        next_mode,
                    },
                };
                if let Err(e) = reply(response) {
                    if let Ok((rows, next)) = granted {
                        self.release_granted(rows.into_iter().chain(next));
                    }
                    return Err(e);
                }
                self.move_out_on_demand(worker, partition);
            }
            Request::RemoteInsert {
                table,
                partition,
                key,
                value,
                lock_next,
                slot,
            } => {
                let handle = self.insert_for_remote(worker, table, partition, key, &value, lock_next);
                if let Err(e) = reply(Response::RemoteInsert { slot, handle }) {
                    if let Some(handle) = handle {
                        self.helper.remote_release_lock(handle, LockMode::Write, None);
                        self.helper.release_migrated_row(handle);
                        self.delete_for_remote(worker, table, partition, key);
                    }
                    return Err(e);
                }
                self.move_out_on_demand(worker, partition);
            }
            Request::RemoteDelete { table, partition, key } => {
                self.delete_for_remote(worker, table, partition, key);
            }
            Request::MoveOutHint { partitions } => {
                for partition in partitions.into_iter().filter(|&p| self.is_local(p)) {
                    self.migration.move_row_out(worker, partition);
                }
            }
        }
        Ok(())
    }

    fn move_out_on_demand(&self, worker: WorkerId, partition: PartitionId) {
        if self.migration.when_to_move_out() == MoveOutTiming::OnDemand {
            self.migration.move_row_out(worker, partition);
        }
    }

    fn find_local_table(&self, table: TableId, partition: PartitionId) -> Option<Arc<dyn Table>> {
        match self.database.find_table(table, partition) {
            Ok(table) => Some(table),
            Err(e) => {
                warn!(host = %self.host, error = %e, "request for a table this host does not own");
                None
            }
        }
    }

    fn migrate_for_remote(
        &self,
        table: TableId,
        partition: PartitionId,
        key: Key,
    ) -> (MigrationStatus, Option<SharedHandle<SharedRow>>) {
        let Some(table) = self.find_local_table(table, partition) else {
            return (MigrationStatus::NotFound, None);
        };
        match self.migration.move_row_in(&table, key, true) {
            MigrationResult::Success(h) | MigrationResult::AlreadyInShared(h) => (MigrationStatus::Migrated, Some(h)),
            MigrationResult::OutOfMemory => (MigrationStatus::OutOfMemory, None),
            MigrationResult::NotFound => (MigrationStatus::NotFound, None),
        }
    }

    /// Migrates, pins and locks a range and its next key for a remote
    /// scan. Nothing stays locked or pinned on failure, and the error says
    /// whether locking or migration failed.
    #[allow(clippy::too_many_arguments)]
    fn lock_range_for_remote(
        &self,
        table: TableId,
        partition: PartitionId,
        min_key: Key,
        max_key: Key,
        limit: usize,
        row_mode: LockMode,
        next_mode: Option<LockMode>,
    ) -> std::result::Result<GrantedRange, ScanStatus> {
        let table = self
            .find_local_table(table, partition)
            .ok_or(ScanStatus::Conflict)?;
        assert_eq!(
            table.kind(),
            TableKind::Ordered,
            "scan on unordered table {}/{partition}",
            table.table_id()
        );
        let (rows, next) = collect_range(table.as_ref(), min_key, max_key, limit);
        let mut granted = Vec::with_capacity(rows.len());
        for entry in &rows {
            match self.grant_for_remote(&table, entry.key, &entry.row, row_mode, true) {
                Ok(g) => granted.push(g),
                Err(status) => {
                    self.release_granted(granted);
                    return Err(status);
                }
            }
        }
        let mut granted_next = None;
        if let (Some(entry), Some(mode)) = (&next, next_mode) {
            match self.grant_for_remote(&table, entry.key, &entry.row, mode, false) {
                Ok(g) => granted_next = Some(g),
                Err(status) => {
                    self.release_granted(granted);
                    return Err(status);
                }
            }
        }
        let keys: Vec<Key> = rows.iter().map(|e| e.key).collect();
        if !range_unchanged(table.as_ref(), min_key, max_key, limit, &keys, next.map(|e| e.key)) {
            self.release_granted(granted.into_iter().chain(granted_next));
            return Err(ScanStatus::Conflict);
        }
        Ok((granted, granted_next))
    }

    fn grant_for_remote(
        &self,
        table: &Arc<dyn Table>,
        key: Key,
        row: &Arc<LocalRow>,
        mode: LockMode,
        must_be_valid: bool,
    ) -> std::result::Result<GrantedRow, ScanStatus> {
        let handle = match self.migration.move_row_in(table, key, true) {
            MigrationResult::Success(h) | MigrationResult::AlreadyInShared(h) => h,
            MigrationResult::OutOfMemory => return Err(ScanStatus::OutOfMemory),
            MigrationResult::NotFound => return Err(ScanStatus::Conflict),
        };
        let locked = if must_be_valid {
            self.helper.take_lock_and_read(row, mode).is_some()
        } else {
            self.helper.lock(row, mode).is_some()
        };
        if !locked {
            self.helper.release_migrated_row(handle);
            return Err(ScanStatus::Conflict);
        }
        Ok(GrantedRow {
            key,
            row: Arc::clone(row),
            handle,
            mode,
        })
    }

    fn release_granted(&self, granted: impl IntoIterator<Item = GrantedRow>) {
        let granted: Vec<_> = granted.into_iter().collect();
        for g in &granted {
            self.helper.release_lock(&g.row, g.mode, None);
        }
        for g in granted {
            self.helper.release_migrated_row(g.handle);
        }
    }

    fn insert_for_remote(
        &self,
        worker: WorkerId,
        table: TableId,
        partition: PartitionId,
        key: Key,
        value: &[u8],
        lock_next: bool,
    ) -> Option<SharedHandle<SharedRow>> {
        let table = self.find_local_table(table, partition)?;
        let next_key = if lock_next && table.kind() == TableKind::Ordered {
            NextKeyLock::Probe
        } else {
            NextKeyLock::None
        };
        self.helper
            .insert_and_update_next_key_info(table.as_ref(), key, value, next_key)?;
        match self.migration.move_row_in(&table, key, true).handle() {
            Some(handle) => Some(handle),
            None => {
                self.migration
                    .delete_specific_row_and_move_out(worker, &table, key, true);
                None
            }
        }
    }

    fn delete_for_remote(&self, worker: WorkerId, table: TableId, partition: PartitionId, key: Key) {
        let Some(table) = self.find_local_table(table, partition) else {
            return;
        };
        if self
            .migration
            .delete_specific_row_and_move_out(worker, &table, key, false)
            .is_none()
        {
            warn!(host = %self.host, table = %table.table_id(), %partition, key, "remote delete of a missing key");
        }
    }
}
