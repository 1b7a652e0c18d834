//! Transaction manager.
//!
//! [`TransactionManager`] owns the engine's shared state: the buffer pool,
//! the log, the transaction table, the operations table, the lock manager,
//! the region and allocator mutexes, and the blob store. Every transactional
//! call goes through it.
//!
//! # Lifecycle
//!
//! ```text
//! begin ──▶ BEGIN
//! commit ──▶ COMMIT ──force──▶ END
//! abort ──▶ ABORT ──undo chain (CLRs)──▶ END
//! prepare ──▶ PREPARE ──force
//! ```
//!
//! Opening a manager formats the region allocator's first boundary tag if
//! the page file is fresh, runs recovery, and rebuilds the record
//! allocator's page list.
//!
//! # Lock order
//!
//! allocator mutex, region mutex, page latch, transaction table. The lock
//! manager is only consulted on the public paths, before any of these are
//! taken.

mod pages;
mod records;
mod table;
mod truncate;
mod update;

pub use table::{TransactionEntry, TransactionState};
pub(crate) use table::TransactionTable;
use truncate::{TruncationWorker, Truncator};

use std::fmt;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use stasis_common::config::{Backend, StasisConfig};
use stasis_common::constants::MAX_TRANSACTIONS;
use stasis_common::types::{Lsn, TxnId};
use stasis_storage::buffer::{BufferPool, BufferPoolConfig, ForceError, ForceLog};
use stasis_storage::file::{FilePageFile, IoError, MemoryPageFile, PageFile};
use stasis_wal::{EntryBody, FileLog, LogConfig, LogHandle, MemoryLog};

use crate::alloc::AllocPolicy;
use crate::blob::{BlobStore, MemoryBlobStore};
use crate::error::{TxnError, TxnResult};
use crate::lock::{LockManager, LockManagerConfig, NoLockManager, PageLockManager};
use crate::operations::{Operation, OperationTable};
use crate::region::RegionLock;

/// Adapts the log to the buffer pool's WAL hook.
struct LogForcer {
    log: Arc<dyn LogHandle>,
}

impl ForceLog for LogForcer {
    fn force_to(&self, lsn: Lsn) -> Result<(), ForceError> {
        self.log.force(lsn).map_err(Into::into)
    }
}

/// Counters for transaction activity.
#[derive(Debug, Default)]
pub struct TransactionStats {
    /// Transactions started.
    pub started: AtomicU64,
    /// Transactions committed.
    pub committed: AtomicU64,
    /// Transactions aborted, including recovery losers.
    pub aborted: AtomicU64,
    /// Transactions prepared.
    pub prepared: AtomicU64,
    /// Deadlock sentinels handed out.
    pub deadlocks: AtomicU64,
    /// UPDATE entries written.
    pub updates: AtomicU64,
    /// CLRs written.
    pub clrs: AtomicU64,
}

impl TransactionStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

/// Builds a [`TransactionManager`] from a configuration and optional
/// overrides for its collaborators.
pub struct TransactionManagerBuilder {
    config: StasisConfig,
    page_file: Option<Arc<dyn PageFile>>,
    log: Option<Arc<dyn LogHandle>>,
    operations: OperationTable,
    blobs: Option<Arc<dyn BlobStore>>,
    locks: Option<Arc<dyn LockManager>>,
}

impl TransactionManagerBuilder {
    /// Uses `page_file` instead of the configured storage backend.
    pub fn page_file(mut self, page_file: Arc<dyn PageFile>) -> Self {
        self.page_file = Some(page_file);
        self
    }

    /// Uses `log` instead of the configured log backend.
    pub fn log(mut self, log: Arc<dyn LogHandle>) -> Self {
        self.log = Some(log);
        self
    }

    /// Registers an additional operation.
    pub fn operation(mut self, op: Operation) -> TxnResult<Self> {
        self.operations.register(op)?;
        Ok(self)
    }

    /// Uses `blobs` for records too large for a page.
    pub fn blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Uses `locks` instead of the configured lock manager.
    pub fn lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Opens the engine: formats or recovers the store and returns a
    /// manager ready for new transactions.
    pub fn open(self) -> TxnResult<TransactionManager> {
        let config = self.config;
        config.validate()?;

        let needs_dir =
            config.storage.backend == Backend::File || config.log.backend == Backend::File;
        if needs_dir && (self.page_file.is_none() || self.log.is_none()) {
            fs::create_dir_all(&config.data_dir)
                .map_err(|err| IoError::from_io_with_path(err, &config.data_dir))?;
        }

        let page_file: Arc<dyn PageFile> = match self.page_file {
            Some(page_file) => page_file,
            None => match config.storage.backend {
                Backend::File => Arc::new(FilePageFile::open(config.page_file_path())?),
                Backend::Memory => Arc::new(MemoryPageFile::new()),
            },
        };
        let log: Arc<dyn LogHandle> = match self.log {
            Some(log) => log,
            None => {
                let log_config = LogConfig::from(&config.log);
                match config.log.backend {
                    Backend::File => Arc::new(FileLog::open(config.log_file_path(), log_config)?),
                    Backend::Memory => Arc::new(MemoryLog::with_config(log_config)),
                }
            }
        };

        let pool = Arc::new(BufferPool::new(
            BufferPoolConfig::from(&config.buffer_pool),
            page_file,
        )?);
        pool.set_log_forcer(Arc::new(LogForcer {
            log: Arc::clone(&log),
        }));

        let locks: Arc<dyn LockManager> = match self.locks {
            Some(locks) => locks,
            None if config.lock.enabled => Arc::new(PageLockManager::with_config(
                LockManagerConfig::from(&config.lock),
            )),
            None => Arc::new(NoLockManager),
        };
        let blobs = self
            .blobs
            .unwrap_or_else(|| Arc::new(MemoryBlobStore::new()));

        let table = Arc::new(Mutex::new(TransactionTable::new(MAX_TRANSACTIONS)));
        let truncation = TruncationWorker::new(Arc::new(Truncator::new(
            Arc::clone(&pool),
            Arc::clone(&log),
            Arc::clone(&table),
        )));

        let tm = TransactionManager {
            pool,
            log,
            table,
            operations: self.operations,
            locks,
            regions: RegionLock::new(),
            allocator: Mutex::new(AllocPolicy::new()),
            blobs,
            stats: TransactionStats::default(),
            truncation_threshold: config.log.truncation_threshold,
            truncation,
            shut_down: AtomicBool::new(false),
        };

        tm.regions_init()?;
        let summary = tm.recover()?;
        tm.talloc_init()?;
        tm.truncation.start()?;

        info!(
            data_dir = %config.data_dir.display(),
            frames = tm.pool.num_frames(),
            redone = summary.redone,
            losers = summary.losers,
            revived = summary.prepared,
            "Opened storage engine"
        );
        Ok(tm)
    }
}

impl fmt::Debug for TransactionManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManagerBuilder")
            .field("config", &self.config)
            .field("operations", &self.operations.len())
            .finish_non_exhaustive()
    }
}

/// The transactional storage engine.
pub struct TransactionManager {
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) log: Arc<dyn LogHandle>,
    pub(crate) table: Arc<Mutex<TransactionTable>>,
    pub(crate) operations: OperationTable,
    pub(crate) locks: Arc<dyn LockManager>,
    pub(crate) regions: RegionLock,
    pub(crate) allocator: Mutex<AllocPolicy>,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) stats: TransactionStats,
    truncation_threshold: u64,
    truncation: TruncationWorker,
    shut_down: AtomicBool,
}

impl TransactionManager {
    /// Starts building a manager for `config`.
    pub fn builder(config: StasisConfig) -> TransactionManagerBuilder {
        TransactionManagerBuilder {
            config,
            page_file: None,
            log: None,
            operations: OperationTable::builtin(),
            blobs: None,
            locks: None,
        }
    }

    /// Opens the engine with the configured backends.
    pub fn open(config: StasisConfig) -> TxnResult<Self> {
        Self::builder(config).open()
    }

    /// Opens the engine over an existing page file and log.
    ///
    /// Reopening the same pair after [`TransactionManager::unclean_shutdown`]
    /// simulates a restart after a crash.
    pub fn open_with(
        config: StasisConfig,
        page_file: Arc<dyn PageFile>,
        log: Arc<dyn LogHandle>,
    ) -> TxnResult<Self> {
        Self::builder(config).page_file(page_file).log(log).open()
    }

    /// Starts a transaction.
    pub fn begin(&self) -> TxnResult<TxnId> {
        self.check_open()?;
        let xid = self.table.lock().insert_new()?;
        if let Err(err) = self.append(xid, EntryBody::Begin) {
            self.table.lock().remove(xid);
            return Err(err);
        }
        self.locks.begin(xid);
        TransactionStats::bump(&self.stats.started);
        debug!(%xid, "Began transaction");
        Ok(xid)
    }

    /// Commits a transaction. Returns once the COMMIT entry is durable.
    pub fn commit(&self, xid: TxnId) -> TxnResult<()> {
        self.check_open()?;
        self.table
            .lock()
            .expect_state(xid, TransactionState::is_open, "Active or Prepared")?
            .state = TransactionState::Committing;

        let commit = self.append(xid, EntryBody::Commit)?;
        self.log.force(commit.lsn)?;
        self.append(xid, EntryBody::End)?;

        let entry = self.finish(xid);
        if let Some(entry) = entry {
            for blob in entry.freed_blobs {
                if let Err(err) = self.blobs.dealloc_blob(blob) {
                    warn!(%xid, blob = blob.id, error = %err, "Failed to release freed blob");
                }
            }
        }
        TransactionStats::bump(&self.stats.committed);
        debug!(%xid, lsn = %commit.lsn, "Committed transaction");

        if self.log.len_bytes() > self.truncation_threshold {
            self.truncation.truncator().request();
        }
        Ok(())
    }

    /// Rolls a transaction back. Undo writes a CLR for every update it
    /// reverses, so a crash during abort resumes where it stopped.
    pub fn abort(&self, xid: TxnId) -> TxnResult<()> {
        self.check_open()?;
        self.table
            .lock()
            .expect_state(xid, TransactionState::is_open, "Active or Prepared")?
            .state = TransactionState::Aborting;

        let abort = self.append(xid, EntryBody::Abort)?;
        self.rollback(xid, abort.prev_lsn)?;
        self.append(xid, EntryBody::End)?;

        if let Some(entry) = self.finish(xid) {
            for blob in entry.new_blobs {
                if let Err(err) = self.blobs.dealloc_blob(blob) {
                    warn!(
                        %xid,
                        blob = blob.id,
                        error = %err,
                        "Failed to release blob of aborted transaction"
                    );
                }
            }
        }
        TransactionStats::bump(&self.stats.aborted);
        debug!(%xid, "Aborted transaction");
        Ok(())
    }

    /// Prepares a transaction for a two-phase commit. A prepared
    /// transaction survives a crash and must then be committed or aborted
    /// explicitly.
    pub fn prepare(&self, xid: TxnId) -> TxnResult<()> {
        self.check_open()?;
        let rec_lsn = {
            let mut table = self.table.lock();
            let entry = table.expect_state(xid, TransactionState::is_active, "Active")?;
            entry.rec_lsn
        };
        let prepare = self.append(xid, EntryBody::Prepare { rec_lsn })?;
        self.log.force(prepare.lsn)?;
        self.table.lock().get_mut(xid)?.state = TransactionState::Prepared;
        TransactionStats::bump(&self.stats.prepared);
        debug!(%xid, lsn = %prepare.lsn, "Prepared transaction");
        Ok(())
    }

    /// Drops a transaction from the table without undoing its updates.
    ///
    /// Writes END so recovery leaves the transaction alone.
    pub fn forget(&self, xid: TxnId) -> TxnResult<()> {
        self.check_open()?;
        self.table.lock().get(xid)?;
        self.append(xid, EntryBody::End)?;
        self.finish(xid);
        debug!(%xid, "Forgot transaction");
        Ok(())
    }

    /// Releases everything a finished transaction holds.
    fn finish(&self, xid: TxnId) -> Option<TransactionEntry> {
        let entry = self.table.lock().remove(xid);
        match entry.as_ref().map(|entry| entry.state) {
            Some(TransactionState::Aborting) => self.locks.abort(xid),
            _ => self.locks.commit(xid),
        }
        self.allocator.lock().release(xid);
        entry
    }

    /// Returns true if `xid` is in the transaction table.
    pub fn is_active(&self, xid: TxnId) -> bool {
        self.table.lock().contains(xid)
    }

    /// Ids of the transactions in the table, in ascending order.
    pub fn active_transactions(&self) -> Vec<TxnId> {
        self.table
            .lock()
            .snapshot()
            .into_iter()
            .map(|entry| entry.xid)
            .collect()
    }

    /// A copy of a transaction's table entry.
    pub fn transaction(&self, xid: TxnId) -> Option<TransactionEntry> {
        self.table.lock().get(xid).ok().cloned()
    }

    /// Moves the log's truncation point as far forward as recovery allows.
    ///
    /// Forces the log, writes back every dirty page and syncs the page
    /// file first. Returns the new truncation point.
    pub fn truncate_log(&self) -> TxnResult<Lsn> {
        self.check_open()?;
        self.truncation.truncator().truncate()
    }

    /// Closes the engine cleanly.
    ///
    /// Active transactions are aborted. Prepared transactions are left in
    /// doubt and revived by the next open.
    pub fn shutdown(&self) -> TxnResult<()> {
        self.check_open()?;
        for entry in self.table.lock().snapshot() {
            if entry.state == TransactionState::Prepared {
                warn!(xid = %entry.xid, "Prepared transaction left in doubt at shutdown");
            }
        }
        let active: Vec<TxnId> = self
            .table
            .lock()
            .snapshot()
            .into_iter()
            .filter(|entry| entry.state.is_active())
            .map(|entry| entry.xid)
            .collect();
        for xid in active {
            self.abort(xid)?;
        }

        self.truncation.stop();
        self.log.force_all()?;
        self.pool.shutdown()?;
        self.shut_down.store(true, AtomicOrdering::Release);
        info!("Storage engine shut down");
        Ok(())
    }

    /// Stops the engine as if the process crashed: dirty pages and the
    /// unforced log tail are thrown away.
    pub fn unclean_shutdown(&self) -> TxnResult<()> {
        self.shut_down.store(true, AtomicOrdering::Release);
        self.truncation.stop();
        self.pool.discard_all();
        self.log.discard_unforced()?;
        warn!("Storage engine stopped without flushing");
        Ok(())
    }

    pub(crate) fn check_open(&self) -> TxnResult<()> {
        if self.shut_down.load(AtomicOrdering::Acquire) {
            return Err(TxnError::ShutDown);
        }
        Ok(())
    }

    /// The buffer pool.
    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    /// The log.
    pub fn log(&self) -> &Arc<dyn LogHandle> {
        &self.log
    }

    /// The operations table.
    pub fn operations(&self) -> &OperationTable {
        &self.operations
    }

    /// The lock manager.
    pub fn lock_manager(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    /// The blob store.
    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Activity counters.
    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("transactions", &self.table.lock().len())
            .field("log", &self.log)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stasis_common::types::RecordId;
    use stasis_wal::EntryType;

    fn open() -> TransactionManager {
        TransactionManager::open(StasisConfig::for_testing()).unwrap()
    }

    fn entry_types(tm: &TransactionManager, xid: TxnId) -> Vec<EntryType> {
        stasis_wal::LogScanner::from_start(tm.log().as_ref())
            .map(|entry| entry.unwrap())
            .filter(|entry| entry.xid == xid)
            .map(|entry| entry.entry_type())
            .collect()
    }

    #[test]
    fn test_begin_assigns_increasing_ids() {
        let tm = open();
        let a = tm.begin().unwrap();
        let b = tm.begin().unwrap();
        assert!(a < b);
        assert_eq!(tm.active_transactions(), vec![a, b]);
        assert_eq!(tm.stats().started.load(AtomicOrdering::Relaxed), 2);
    }

    #[test]
    fn test_commit_logs_and_forces() {
        let tm = open();
        let xid = tm.begin().unwrap();
        tm.commit(xid).unwrap();

        assert!(!tm.is_active(xid));
        assert_eq!(
            entry_types(&tm, xid),
            vec![EntryType::Begin, EntryType::Commit, EntryType::End]
        );
        assert!(tm.log().flushed_lsn() > Lsn::FIRST);
    }

    #[test]
    fn test_abort_of_empty_transaction() {
        let tm = open();
        let xid = tm.begin().unwrap();
        tm.abort(xid).unwrap();
        assert_eq!(
            entry_types(&tm, xid),
            vec![EntryType::Begin, EntryType::Abort, EntryType::End]
        );
        assert!(matches!(tm.commit(xid), Err(TxnError::NotFound { .. })));
    }

    #[test]
    fn test_prepare_then_commit() {
        let tm = open();
        let xid = tm.begin().unwrap();
        tm.prepare(xid).unwrap();
        assert_eq!(
            tm.transaction(xid).unwrap().state,
            TransactionState::Prepared
        );
        assert!(matches!(
            tm.prepare(xid),
            Err(TxnError::InvalidState { .. })
        ));
        tm.commit(xid).unwrap();
        assert!(!tm.is_active(xid));
    }

    #[test]
    fn test_prepared_transaction_cannot_update() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let rid = tm.alloc(xid, 4).unwrap();
        tm.prepare(xid).unwrap();
        let err = tm.set(xid, rid, &[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, TxnError::InvalidState { .. }));
        tm.abort(xid).unwrap();
    }

    #[test]
    fn test_forget_writes_end() {
        let tm = open();
        let xid = tm.begin().unwrap();
        tm.forget(xid).unwrap();
        assert!(!tm.is_active(xid));
        assert_eq!(entry_types(&tm, xid), vec![EntryType::Begin, EntryType::End]);
    }

    #[test]
    fn test_shutdown_aborts_active_transactions() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let rid = tm.alloc(xid, 8).unwrap();
        tm.shutdown().unwrap();
        assert!(!tm.is_active(xid));
        assert!(matches!(tm.begin(), Err(TxnError::ShutDown)));
        assert_ne!(rid, RecordId::INVALID);
    }

    #[test]
    fn test_truncate_log_stops_at_active_transaction() {
        let tm = open();
        let done = tm.begin().unwrap();
        tm.alloc(done, 16).unwrap();
        tm.commit(done).unwrap();

        let open_xid = tm.begin().unwrap();
        let rec_lsn = tm.transaction(open_xid).unwrap().rec_lsn;
        let point = tm.truncate_log().unwrap();
        assert!(point <= rec_lsn);
        assert!(tm.log().truncation_point() <= rec_lsn);
        tm.commit(open_xid).unwrap();
    }
}
