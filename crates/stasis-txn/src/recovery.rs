//! Restart recovery.
//!
//! Recovery runs when the manager opens, in three passes over the log from
//! its truncation point:
//!
//! 1. **Analysis** finds every transaction with entries in the log and
//!    classifies it: finished, committed without END, prepared, or a loser.
//! 2. **Redo** repeats history. Every physical UPDATE and CLR is reapplied
//!    to its page unless the page LSN shows the change already reached the
//!    page file.
//! 3. **Undo** rolls losers back through the normal undo path, writing CLRs
//!    as it goes. Prepared transactions are put back in the table instead.
//!
//! Redo is idempotent and undo resumes from the CLRs a previous attempt
//! wrote, so a crash during recovery is recovered like any other.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use stasis_common::types::{Lsn, TxnId};
use stasis_wal::{EntryBody, LogEntry, LogScanner};

use crate::error::{TxnError, TxnResult};
use crate::manager::{TransactionManager, TransactionState, TransactionStats};
use crate::operations::Apply;

/// What recovery found and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RecoverySummary {
    /// Log entries reapplied to pages.
    pub(crate) redone: usize,
    /// Transactions rolled back.
    pub(crate) losers: usize,
    /// Prepared transactions put back in the table.
    pub(crate) prepared: usize,
}

/// A transaction as the log describes it.
#[derive(Debug, Default)]
struct LoggedTransaction {
    last_lsn: Lsn,
    committed: bool,
    aborted: bool,
    ended: bool,
    prepared: Option<Lsn>,
}

impl LoggedTransaction {
    fn observe(&mut self, entry: &LogEntry) {
        self.last_lsn = entry.lsn;
        match entry.body {
            EntryBody::Commit => self.committed = true,
            EntryBody::Abort => self.aborted = true,
            EntryBody::End => self.ended = true,
            EntryBody::Prepare { rec_lsn } => self.prepared = Some(rec_lsn),
            _ => {}
        }
    }

    fn is_in_doubt(&self) -> bool {
        self.prepared.is_some() && !self.committed && !self.aborted && !self.ended
    }

    fn is_loser(&self) -> bool {
        !self.committed && !self.ended && !self.is_in_doubt()
    }
}

impl TransactionManager {
    pub(crate) fn recover(&self) -> TxnResult<RecoverySummary> {
        let start = self.log.truncation_point();
        let logged = self.analyze(start)?;
        let mut summary = RecoverySummary {
            redone: self.redo(start)?,
            ..RecoverySummary::default()
        };

        {
            let mut table = self.table.lock();
            for xid in logged.keys() {
                table.observe_xid(*xid);
            }
        }

        for (&xid, txn) in &logged {
            if txn.committed && !txn.ended {
                self.table
                    .lock()
                    .revive(xid, txn.last_lsn, Lsn::INVALID, TransactionState::Committing)?;
                self.append(xid, EntryBody::End)?;
                self.table.lock().remove(xid);
                debug!(%xid, "Finished committed transaction");
            } else if let Some(rec_lsn) = txn.prepared.filter(|_| txn.is_in_doubt()) {
                self.table
                    .lock()
                    .revive(xid, txn.last_lsn, rec_lsn, TransactionState::Prepared)?;
                summary.prepared += 1;
                warn!(%xid, "Revived prepared transaction");
            }
        }

        let mut losers: Vec<(TxnId, &LoggedTransaction)> = logged
            .iter()
            .filter(|(_, txn)| txn.is_loser())
            .map(|(xid, txn)| (*xid, txn))
            .collect();
        losers.sort_by(|a, b| b.1.last_lsn.cmp(&a.1.last_lsn));
        for (xid, txn) in losers {
            self.undo_loser(xid, txn)?;
            summary.losers += 1;
        }

        self.log.force_all()?;
        if summary.redone > 0 || summary.losers > 0 || summary.prepared > 0 {
            info!(
                from = %start,
                redone = summary.redone,
                losers = summary.losers,
                prepared = summary.prepared,
                "Recovered"
            );
        }
        Ok(summary)
    }

    fn analyze(&self, start: Lsn) -> TxnResult<BTreeMap<TxnId, LoggedTransaction>> {
        let mut logged: BTreeMap<TxnId, LoggedTransaction> = BTreeMap::new();
        for entry in LogScanner::new(self.log.as_ref(), start) {
            let entry = entry?;
            logged.entry(entry.xid).or_default().observe(&entry);
        }
        debug!(transactions = logged.len(), "Analysis complete");
        Ok(logged)
    }

    /// Reapplies physical changes the page file may have missed. Returns
    /// the number of entries applied.
    fn redo(&self, start: Lsn) -> TxnResult<usize> {
        let mut redone = 0;
        for entry in LogScanner::new(self.log.as_ref(), start) {
            let entry = entry?;
            let Some(update) = entry.redo_update() else {
                continue;
            };
            if update.is_logical() {
                continue;
            }
            let Apply::Physical(apply) = self.operations.redo_of(update.op)?.apply else {
                continue;
            };

            let handle = self.pool.load_page(update.rid.page)?;
            let mut page = handle.write();
            if page.lsn() >= entry.lsn {
                continue;
            }
            apply(&mut page, update.rid, &update.arg)
                .map_err(|err| TxnError::recovery(entry.lsn, format!("redo failed: {err}")))?;
            page.set_lsn(entry.lsn);
            redone += 1;
        }
        Ok(redone)
    }

    /// Rolls back a transaction that neither finished nor prepared.
    fn undo_loser(&self, xid: TxnId, txn: &LoggedTransaction) -> TxnResult<()> {
        self.table
            .lock()
            .revive(xid, txn.last_lsn, Lsn::INVALID, TransactionState::Aborting)?;
        if !txn.aborted {
            self.append(xid, EntryBody::Abort)?;
        }
        self.rollback(xid, txn.last_lsn)?;
        self.append(xid, EntryBody::End)?;
        self.table.lock().remove(xid);
        TransactionStats::bump(&self.stats.aborted);
        debug!(%xid, "Rolled back loser");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use stasis_common::config::StasisConfig;
    use stasis_common::types::RecordId;
    use stasis_storage::file::{MemoryPageFile, PageFile};
    use stasis_wal::{LogHandle, MemoryLog};

    use super::*;

    struct Disk {
        pages: Arc<MemoryPageFile>,
        log: Arc<MemoryLog>,
    }

    impl Disk {
        fn new() -> Self {
            Self {
                pages: Arc::new(MemoryPageFile::new()),
                log: Arc::new(MemoryLog::new()),
            }
        }

        fn open(&self) -> TransactionManager {
            let pages: Arc<dyn PageFile> = self.pages.clone();
            let log: Arc<dyn LogHandle> = self.log.clone();
            TransactionManager::open_with(StasisConfig::for_testing(), pages, log).unwrap()
        }
    }

    fn read_i32(tm: &TransactionManager, rid: RecordId) -> i32 {
        let xid = tm.begin().unwrap();
        let value = tm.read(xid, rid).unwrap();
        tm.commit(xid).unwrap();
        i32::from_le_bytes(value.try_into().unwrap())
    }

    fn committed_counter(tm: &TransactionManager, value: i32) -> RecordId {
        let xid = tm.begin().unwrap();
        let rid = tm.alloc(xid, 4).unwrap();
        tm.set(xid, rid, &value.to_le_bytes()).unwrap();
        tm.commit(xid).unwrap();
        rid
    }

    #[test]
    fn test_committed_work_is_redone() {
        let disk = Disk::new();
        let tm = disk.open();
        let rid = committed_counter(&tm, 7);
        tm.unclean_shutdown().unwrap();
        drop(tm);

        let tm = disk.open();
        assert_eq!(read_i32(&tm, rid), 7);
    }

    #[test]
    fn test_stolen_page_of_loser_is_undone() {
        let disk = Disk::new();
        let tm = disk.open();
        let rid = committed_counter(&tm, 1);

        let loser = tm.begin().unwrap();
        tm.set(loser, rid, &99i32.to_le_bytes()).unwrap();
        // Writing the page back forces the log first.
        tm.buffer_pool().flush_all().unwrap();
        tm.unclean_shutdown().unwrap();
        drop(tm);

        let tm = disk.open();
        assert_eq!(read_i32(&tm, rid), 1);
        assert!(!tm.is_active(loser));
        assert_eq!(tm.stats().aborted.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_prepared_transaction_is_revived() {
        let disk = Disk::new();
        let tm = disk.open();
        let rid = committed_counter(&tm, 3);

        let xid = tm.begin().unwrap();
        tm.set(xid, rid, &4i32.to_le_bytes()).unwrap();
        tm.prepare(xid).unwrap();
        tm.unclean_shutdown().unwrap();
        drop(tm);

        let tm = disk.open();
        let entry = tm.transaction(xid).unwrap();
        assert_eq!(entry.state, TransactionState::Prepared);
        tm.abort(xid).unwrap();
        assert_eq!(read_i32(&tm, rid), 3);
    }

    #[test]
    fn test_new_xids_follow_logged_ones() {
        let disk = Disk::new();
        let tm = disk.open();
        let last = tm.begin().unwrap();
        tm.commit(last).unwrap();
        tm.unclean_shutdown().unwrap();
        drop(tm);

        let tm = disk.open();
        assert!(tm.begin().unwrap() > last);
    }

    #[test]
    fn test_recovery_twice_is_stable() {
        let disk = Disk::new();
        let tm = disk.open();
        let rid = committed_counter(&tm, 10);
        let loser = tm.begin().unwrap();
        tm.increment(loser, rid, 5).unwrap();
        tm.log().force_all().unwrap();
        tm.unclean_shutdown().unwrap();
        drop(tm);

        let tm = disk.open();
        assert_eq!(read_i32(&tm, rid), 10);
        tm.unclean_shutdown().unwrap();
        drop(tm);

        let tm = disk.open();
        assert_eq!(read_i32(&tm, rid), 10);
        tm.shutdown().unwrap();
    }
}
