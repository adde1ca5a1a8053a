//! Worker execution of transactions.
//!
//! A [`WorkerCore`] runs one transaction attempt at a time. Transaction
//! logic registers accesses through a [`TxnScope`]; local keys are locked
//! on the spot, remote keys either hit a tuple already in the shared
//! region or turn into a request to the owner. While waiting for
//! responses the worker serves requests from other hosts, so two hosts
//! waiting on each other always make progress.

use crate::helper::NextKeyLock;
use crate::message::{Envelope, Request, Response};
use crate::rwkey::{
    past_range, DeleteKey, InsertKey, LockMode, RowLoc, RowTarget, ScanKey, ScanKind, ScanRow,
    SharedRowRef,
};
use crate::runtime::HostRuntime;
use crate::transaction::{AbortReason, TwoPlPashaTransaction, TxnOutcome};
use bytes::Bytes;
use crossbeam_channel::{select, Receiver};
use pasha_common::{HostId, Key, PartitionId, PashaError, Result, TableId, Tid, WorkerId};
use pasha_cxl::RegionKey;
use pasha_storage::{RowEntry, Table, TableKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// How long a waiting worker blocks before rechecking its deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Counters of one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub committed: u64,
    pub aborted: u64,
    pub remote_requests: u64,
    pub served_requests: u64,
    pub stale_responses: u64,
}

/// A worker thread's transaction state and message queues.
pub struct WorkerCore {
    pub(crate) id: WorkerId,
    pub(crate) host: Arc<HostRuntime>,
    requests: Receiver<Envelope<Request>>,
    responses: Receiver<Envelope<Response>>,
    pub(crate) max_tid: Tid,
    next_txn_id: u64,
    pub(crate) txn: TwoPlPashaTransaction,
    pub(crate) stats: WorkerStats,
}

impl WorkerCore {
    /// # Panics
    ///
    /// Panics if `id` does not run on `host`.
    pub fn new(host: Arc<HostRuntime>, id: WorkerId) -> Self {
        assert_eq!(
            host.transport.host_of(id),
            host.host,
            "{id} does not run on {}",
            host.host
        );
        Self {
            requests: host.transport.request_receiver(host.host),
            responses: host.transport.response_receiver(id),
            id,
            host,
            max_tid: 0,
            next_txn_id: 0,
            txn: TwoPlPashaTransaction::new(0),
            stats: WorkerStats::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn host(&self) -> &Arc<HostRuntime> {
        &self.host
    }

    /// Largest commit timestamp this worker has issued.
    #[inline]
    pub fn max_tid(&self) -> Tid {
        self.max_tid
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Reference counts the current attempt still holds.
    pub fn reference_counts_held(&self) -> usize {
        self.txn.reference_counts_held()
    }

    /// Announces this worker to reclamation and frees what became safe.
    fn enter_epoch(&self) {
        let pool = self.host.helper.pool();
        self.host
            .helper
            .ebr()
            .enter_critical_section(self.id, |obj| pool.free_raw(obj.raw, obj.category));
    }

    fn begin_attempt(&mut self) {
        self.next_txn_id += 1;
        self.txn.reset(self.next_txn_id);
        self.enter_epoch();
    }

    /// Runs one attempt of `logic`.
    ///
    /// The logic registers its accesses and returns `Ok(true)` to commit,
    /// `Ok(false)` to abort. Accesses are processed before the logic
    /// returns only where it calls [`TxnScope::process`]; the rest are
    /// processed before commit. An error from the logic aborts the attempt
    /// and is returned.
    pub fn execute<F>(&mut self, mut logic: F) -> Result<TxnOutcome>
    where
        F: FnMut(&mut TxnScope<'_>) -> Result<bool>,
    {
        self.begin_attempt();
        let verdict = logic(&mut TxnScope { core: self });
        let proceed = match verdict {
            Ok(proceed) => proceed,
            Err(e) => return Err(self.abort_with_error(e)),
        };
        if proceed {
            if let Err(e) = self.process_requests() {
                return Err(self.abort_with_error(e));
            }
            if !self.txn.should_abort() {
                return self.commit();
            }
        }
        let reason = self.txn.abort_reason().unwrap_or(AbortReason::Requested);
        self.abort(reason)?;
        Ok(TxnOutcome::Aborted(reason))
    }

    /// Retries `logic` until it commits, it asks to abort, or
    /// `max_attempts` attempts failed on conflicts. Returns the last
    /// outcome.
    pub fn execute_until_commit<F>(&mut self, max_attempts: usize, mut logic: F) -> Result<TxnOutcome>
    where
        F: FnMut(&mut TxnScope<'_>) -> Result<bool>,
    {
        let mut outcome = TxnOutcome::Aborted(AbortReason::Requested);
        for attempt in 0..max_attempts.max(1) {
            outcome = self.execute(&mut logic)?;
            match outcome {
                TxnOutcome::Committed { .. } | TxnOutcome::Aborted(AbortReason::Requested) => break,
                TxnOutcome::Aborted(reason) => {
                    trace!(worker = %self.id, attempt, %reason, "retrying");
                    self.serve_pending()?;
                    std::thread::yield_now();
                }
            }
        }
        Ok(outcome)
    }

    /// Aborts after `error` ended the attempt early and hands the error back.
    pub(crate) fn abort_with_error(&mut self, error: PashaError) -> PashaError {
        let reason = self.txn.abort_reason().unwrap_or(AbortReason::Requested);
        if let Err(abort_error) = self.abort(reason) {
            warn!(worker = %self.id, error = %abort_error, "cleanup after a failed attempt");
        }
        error
    }

    /// Serves queued requests without blocking. Returns how many were
    /// served.
    pub fn serve_pending(&mut self) -> Result<usize> {
        let mut served = 0;
        while let Ok(envelope) = self.requests.try_recv() {
            self.serve(envelope)?;
            served += 1;
        }
        while let Ok(envelope) = self.responses.try_recv() {
            self.handle_response(envelope)?;
        }
        Ok(served)
    }

    /// Serves requests until `stop` is set.
    pub fn serve_until(&mut self, stop: &AtomicBool) -> Result<()> {
        let requests = self.requests.clone();
        let responses = self.responses.clone();
        while !stop.load(Ordering::Acquire) {
            self.enter_epoch();
            select! {
                recv(requests) -> msg => {
                    let envelope = msg.map_err(|_| disconnected("request"))?;
                    self.serve(envelope)?;
                }
                recv(responses) -> msg => {
                    let envelope = msg.map_err(|_| disconnected("response"))?;
                    self.handle_response(envelope)?;
                }
                default(POLL_INTERVAL) => {}
            }
        }
        Ok(())
    }

    fn serve(&mut self, envelope: Envelope<Request>) -> Result<()> {
        self.stats.served_requests += 1;
        self.host.serve_request(self.id, envelope)
    }

    pub(crate) fn send(&mut self, owner: HostId, body: Request) -> Result<()> {
        self.stats.remote_requests += 1;
        self.host.transport.send_request(
            owner,
            Envelope {
                from: self.id,
                txn_id: self.txn.id(),
                body,
            },
        )
    }

    // -------------------------------------------------------------------------
    // Request processing
    // -------------------------------------------------------------------------

    /// Locks every access registered and not yet processed, then waits for
    /// the owners of remote keys. Stops issuing once a failure is known.
    /// Returns false if the attempt must abort.
    pub(crate) fn process_requests(&mut self) -> Result<bool> {
        for i in 0..self.txn.read_set.len() {
            if self.txn.should_abort() {
                break;
            }
            if !self.txn.read_set[i].processed {
                self.process_read(i)?;
            }
        }
        for s in 0..self.txn.scan_set.len() {
            if self.txn.should_abort() {
                break;
            }
            if !self.txn.scan_set[s].processed {
                self.process_scan(s)?;
            }
        }
        for k in 0..self.txn.insert_set.len() {
            if self.txn.should_abort() {
                break;
            }
            if !self.txn.insert_set[k].processed {
                self.process_insert(k)?;
            }
        }
        self.wait_for_responses()?;
        if !self.txn.should_abort() {
            for d in 0..self.txn.delete_set.len() {
                if !self.txn.delete_set[d].processed {
                    self.check_delete(d);
                }
            }
        }
        Ok(!self.txn.should_abort())
    }

    fn process_read(&mut self, i: usize) -> Result<()> {
        let (table_id, partition, key, mode, local_index_read) = {
            let k = &self.txn.read_set[i];
            (k.table, k.partition, k.key, k.mode, k.local_index_read)
        };
        let helper = Arc::clone(&self.host.helper);

        if self.host.is_local(partition) {
            self.txn.read_set[i].processed = true;
            let table = self.host.database.find_table(table_id, partition)?;
            let Some(row) = table.search(key) else {
                self.txn.abort_lock = true;
                return Ok(());
            };
            if local_index_read {
                match helper.read_local_index(&row) {
                    Some(value) => {
                        let k = &mut self.txn.read_set[i];
                        k.value = value;
                        k.granted = true;
                    }
                    None => self.txn.abort_lock = true,
                }
                return Ok(());
            }
            match helper.take_lock_and_read(&row, mode) {
                Some((tid, value)) => {
                    if let Some(handle) = row.migrated() {
                        self.host.migration.access_row(handle);
                    }
                    self.txn.read_set[i].grant(tid, value, RowTarget::Local(row));
                }
                None => self.txn.abort_lock = true,
            }
            return Ok(());
        }

        let owner = self.host.owner_of(partition);
        self.txn.note_remote(owner, partition);
        // Unlocked reads only cover rows this host owns.
        self.txn.read_set[i].local_index_read = false;

        let region_key = RegionKey::new(table_id, partition, key);
        if let Some(handle) = helper.get_migrated_row(&region_key, false) {
            self.txn.read_set[i].processed = true;
            match helper.remote_take_lock_and_read(handle, mode, true) {
                Some((tid, value)) => {
                    let guard = SharedRowRef::adopt(Arc::clone(helper.pool()), handle);
                    self.txn.read_set[i].grant(tid, value, RowTarget::Shared(guard));
                }
                None => self.txn.abort_lock = true,
            }
            return Ok(());
        }

        self.send(
            owner,
            Request::DataMigration {
                table: table_id,
                partition,
                key,
                slot: i,
            },
        )?;
        self.txn.pending_responses += 1;
        Ok(())
    }

    fn process_scan(&mut self, s: usize) -> Result<()> {
        let (table_id, partition, min_key, max_key, limit, kind) = {
            let k = &self.txn.scan_set[s];
            (k.table, k.partition, k.min_key, k.max_key, k.limit, k.kind)
        };
        let row_mode = kind.row_mode();
        let next_mode = self
            .host
            .helper
            .enable_phantom_detection()
            .then(|| kind.next_key_mode());

        if !self.host.is_local(partition) {
            let owner = self.host.owner_of(partition);
            self.txn.note_remote(owner, partition);
            self.send(
                owner,
                Request::DataMigrationForScan {
                    table: table_id,
                    partition,
                    min_key,
                    max_key,
                    limit,
                    row_mode,
                    next_mode,
                    slot: s,
                },
            )?;
            self.txn.pending_responses += 1;
            return Ok(());
        }

        self.txn.scan_set[s].processed = true;
        let helper = Arc::clone(&self.host.helper);
        let table = self.host.database.find_table(table_id, partition)?;
        assert_eq!(
            table.kind(),
            TableKind::Ordered,
            "scan on unordered table {table_id}/{partition}"
        );
        let (rows, next) = collect_range(table.as_ref(), min_key, max_key, limit);
        for entry in &rows {
            let Some((tid, value)) = helper.take_lock_and_read(&entry.row, row_mode) else {
                self.txn.abort_lock = true;
                return Ok(());
            };
            if let Some(handle) = entry.row.migrated() {
                self.host.migration.access_row(handle);
            }
            self.txn.scan_set[s].rows.push(ScanRow {
                key: entry.key,
                value,
                tid,
                mode: row_mode,
                dirty: false,
                target: RowTarget::Local(Arc::clone(&entry.row)),
            });
        }
        if let (Some(entry), Some(mode)) = (&next, next_mode) {
            let Some(tid) = helper.lock(&entry.row, mode) else {
                self.txn.abort_lock = true;
                return Ok(());
            };
            self.txn.scan_set[s].next_row = Some(ScanRow {
                key: entry.key,
                value: Bytes::new(),
                tid,
                mode,
                dirty: false,
                target: RowTarget::Local(Arc::clone(&entry.row)),
            });
        }
        // A key inserted between collecting and locking would be a phantom.
        let keys: Vec<Key> = rows.iter().map(|e| e.key).collect();
        if !range_unchanged(table.as_ref(), min_key, max_key, limit, &keys, next.map(|e| e.key)) {
            self.txn.abort_lock = true;
        }
        Ok(())
    }

    fn process_insert(&mut self, k: usize) -> Result<()> {
        let (table_id, partition, key, value, require_lock_next_key) = {
            let ins = &self.txn.insert_set[k];
            (ins.table, ins.partition, ins.key, ins.value.clone(), ins.require_lock_next_key)
        };
        let lock_next = require_lock_next_key && self.host.helper.enable_phantom_detection();

        if !self.host.is_local(partition) {
            let owner = self.host.owner_of(partition);
            self.txn.note_remote(owner, partition);
            self.send(
                owner,
                Request::RemoteInsert {
                    table: table_id,
                    partition,
                    key,
                    value,
                    lock_next,
                    slot: k,
                },
            )?;
            self.txn.pending_responses += 1;
            return Ok(());
        }

        self.txn.insert_set[k].processed = true;
        let table = self.host.database.find_table(table_id, partition)?;
        let next_key = if lock_next && table.kind() == TableKind::Ordered {
            NextKeyLock::Hold
        } else {
            NextKeyLock::None
        };
        match self
            .host
            .helper
            .insert_and_update_next_key_info(table.as_ref(), key, &value, next_key)
        {
            Some((row, next_row)) => {
                let ins = &mut self.txn.insert_set[k];
                ins.target = Some(RowTarget::Local(row));
                ins.next_row = next_row;
            }
            None => self.txn.abort_insert = true,
        }
        Ok(())
    }

    /// A delete is valid once its victim is write-locked.
    fn check_delete(&mut self, d: usize) {
        let (key, loc) = {
            let del = &self.txn.delete_set[d];
            (del.key, del.loc)
        };
        let locked = match loc {
            RowLoc::Read(i) => {
                let k = &self.txn.read_set[i];
                k.granted && k.mode == LockMode::Write && k.target.is_some()
            }
            RowLoc::Scan(s, r) => self.txn.scan_set[s].rows.get(r).is_some_and(|row| row.key == key),
        };
        if !locked {
            self.txn.abort_delete = true;
        }
        self.txn.delete_set[d].processed = true;
    }

    fn wait_for_responses(&mut self) -> Result<()> {
        if self.txn.pending_responses == 0 {
            return Ok(());
        }
        let requests = self.requests.clone();
        let responses = self.responses.clone();
        let timeout_ms = self.host.config.remote_wait_timeout_ms;
        let started = Instant::now();
        while self.txn.pending_responses > 0 {
            select! {
                recv(responses) -> msg => {
                    let envelope = msg.map_err(|_| disconnected("response"))?;
                    self.handle_response(envelope)?;
                }
                recv(requests) -> msg => {
                    let envelope = msg.map_err(|_| disconnected("request"))?;
                    self.serve(envelope)?;
                }
                default(POLL_INTERVAL) => {}
            }
            let waited_ms = started.elapsed().as_millis() as u64;
            if timeout_ms > 0 && waited_ms >= timeout_ms && self.txn.pending_responses > 0 {
                return Err(PashaError::RemoteTimeout {
                    waited_ms,
                    pending: self.txn.pending_responses,
                });
            }
        }
        Ok(())
    }
}

fn disconnected(queue: &str) -> PashaError {
    PashaError::TransportDisconnected(format!("{queue} queue closed"))
}

/// Rows of an ordered table in `[min_key, max_key]`, at most `limit`, and
/// the first row past them.
pub(crate) fn collect_range(
    table: &dyn Table,
    min_key: Key,
    max_key: Key,
    limit: usize,
) -> (Vec<RowEntry>, Option<RowEntry>) {
    let mut rows = Vec::new();
    let mut next = None;
    table.scan(min_key, &mut |entry| {
        if past_range(entry.key, max_key, limit, rows.len()) {
            next = Some(entry.clone());
            return false;
        }
        rows.push(entry.clone());
        true
    });
    (rows, next)
}

/// Returns true if collecting the range again finds the same keys.
pub(crate) fn range_unchanged(
    table: &dyn Table,
    min_key: Key,
    max_key: Key,
    limit: usize,
    keys: &[Key],
    next: Option<Key>,
) -> bool {
    let (rows, again) = collect_range(table, min_key, max_key, limit);
    rows.len() == keys.len()
        && rows.iter().zip(keys).all(|(e, k)| e.key == *k)
        && again.map(|e| e.key) == next
}

/// Access registration for one transaction attempt.
pub struct TxnScope<'a> {
    core: &'a mut WorkerCore,
}

impl TxnScope<'_> {
    pub fn txn_id(&self) -> u64 {
        self.core.txn.id()
    }

    pub fn worker(&self) -> WorkerId {
        self.core.id
    }

    /// Registers a read-locked read. Returns the read-set index.
    pub fn search_for_read(&mut self, table: TableId, partition: PartitionId, key: Key) -> usize {
        self.core
            .txn
            .add_read_key(table, partition, key, LockMode::Read, false)
    }

    /// Registers a write-locked read. Returns the read-set index.
    pub fn search_for_update(&mut self, table: TableId, partition: PartitionId, key: Key) -> usize {
        self.core
            .txn
            .add_read_key(table, partition, key, LockMode::Write, false)
    }

    /// Registers an unlocked read of a table every host keeps a copy of.
    pub fn search_local_index(&mut self, table: TableId, partition: PartitionId, key: Key) -> usize {
        self.core
            .txn
            .add_read_key(table, partition, key, LockMode::Read, true)
    }

    /// Buffers a new value for a row read with [`Self::search_for_update`].
    ///
    /// # Panics
    ///
    /// Panics if the row was not registered for update.
    pub fn update(&mut self, index: usize, value: impl Into<Bytes>) {
        let k = &self.core.txn.read_set[index];
        assert_eq!(
            k.mode,
            LockMode::Write,
            "update of {}/{}/{} without a write lock",
            k.table,
            k.partition,
            k.key
        );
        self.core.txn.add_write(RowLoc::Read(index), value.into());
    }

    /// Buffers a new value for row `row` of an update scan.
    ///
    /// # Panics
    ///
    /// Panics if the scan does not write-lock its rows or returned fewer
    /// rows.
    pub fn update_scan_row(&mut self, scan: usize, row: usize, value: impl Into<Bytes>) {
        let s = &self.core.txn.scan_set[scan];
        assert_eq!(s.kind.row_mode(), LockMode::Write, "update through a {:?} scan", s.kind);
        assert!(row < s.rows.len(), "scan {scan} returned {} rows", s.rows.len());
        self.core.txn.add_write(RowLoc::Scan(scan, row), value.into());
    }

    fn add_scan(
        &mut self,
        table: TableId,
        partition: PartitionId,
        min_key: Key,
        max_key: Key,
        limit: usize,
        kind: ScanKind,
    ) -> usize {
        let txn = &mut self.core.txn;
        txn.scan_set
            .push(ScanKey::new(table, partition, min_key, max_key, limit, kind));
        txn.scan_set.len() - 1
    }

    /// Registers a read-locked range scan. Returns the scan-set index.
    pub fn scan_for_read(
        &mut self,
        table: TableId,
        partition: PartitionId,
        min_key: Key,
        max_key: Key,
        limit: usize,
    ) -> usize {
        self.add_scan(table, partition, min_key, max_key, limit, ScanKind::Read)
    }

    /// Registers a write-locked range scan.
    pub fn scan_for_update(
        &mut self,
        table: TableId,
        partition: PartitionId,
        min_key: Key,
        max_key: Key,
        limit: usize,
    ) -> usize {
        self.add_scan(table, partition, min_key, max_key, limit, ScanKind::Update)
    }

    /// Registers a scan guarding later inserts into the range.
    pub fn scan_for_insert(
        &mut self,
        table: TableId,
        partition: PartitionId,
        min_key: Key,
        max_key: Key,
        limit: usize,
    ) -> usize {
        self.add_scan(table, partition, min_key, max_key, limit, ScanKind::Insert)
    }

    /// Registers a scan whose rows are about to be deleted.
    pub fn scan_for_delete(
        &mut self,
        table: TableId,
        partition: PartitionId,
        min_key: Key,
        max_key: Key,
        limit: usize,
    ) -> usize {
        self.add_scan(table, partition, min_key, max_key, limit, ScanKind::Delete)
    }

    /// Registers an insert. The row becomes visible at commit.
    pub fn insert_row(
        &mut self,
        table: TableId,
        partition: PartitionId,
        key: Key,
        value: impl Into<Bytes>,
        require_lock_next_key: bool,
    ) -> usize {
        let txn = &mut self.core.txn;
        txn.insert_set.push(InsertKey {
            table,
            partition,
            key,
            value: value.into(),
            require_lock_next_key,
            processed: false,
            target: None,
            next_row: None,
        });
        txn.insert_set.len() - 1
    }

    /// Registers a delete. The row disappears at commit.
    pub fn delete_row(&mut self, table: TableId, partition: PartitionId, key: Key) -> usize {
        let held = self
            .core
            .txn
            .find_read(table, partition, key)
            .filter(|&i| self.core.txn.read_set[i].mode == LockMode::Write);
        let loc = match held {
            Some(i) => RowLoc::Read(i),
            None if self.core.host.table_kind(table) == Some(TableKind::Ordered) => {
                RowLoc::Scan(self.add_scan(table, partition, key, key, 1, ScanKind::Delete), 0)
            }
            None => RowLoc::Read(
                self.core
                    .txn
                    .add_read_key(table, partition, key, LockMode::Write, false),
            ),
        };
        let txn = &mut self.core.txn;
        txn.delete_set.push(DeleteKey {
            table,
            partition,
            key,
            loc,
            processed: false,
        });
        txn.delete_set.len() - 1
    }

    /// Processes every access registered so far. Returns false once the
    /// attempt is doomed.
    pub fn process(&mut self) -> Result<bool> {
        self.core.process_requests()
    }

    /// Value of a processed read.
    pub fn value(&self, index: usize) -> &Bytes {
        self.core.txn.value(index)
    }

    pub fn is_granted(&self, index: usize) -> bool {
        self.core.txn.read_set[index].granted
    }

    /// Rows of a processed scan in key order.
    pub fn scan_results(&self, scan: usize) -> &[ScanRow] {
        &self.core.txn.scan_set[scan].rows
    }

    /// Returns true if a failure already dooms the attempt.
    pub fn should_abort(&self) -> bool {
        self.core.txn.should_abort()
    }
}
