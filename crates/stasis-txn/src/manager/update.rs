//! Logging and applying updates, and the undo walk.

use bytes::Bytes;
use tracing::trace;

use stasis_common::types::{Lsn, RecordId, TxnId};
use stasis_wal::{ClrEntry, EntryBody, EntryFlags, LogEntry, UpdateEntry};

use super::{TransactionManager, TransactionState, TransactionStats};
use crate::error::{TxnError, TxnResult};
use crate::operations::{Apply, LogicalFn, OperationId};

impl TransactionManager {
    /// Logs and applies operation `op` against `rid`.
    ///
    /// Page operations take the record's write lock, log an UPDATE and
    /// apply it under the page latch. Logical operations run first and
    /// are logged only once they succeed. Returns the LSN of the UPDATE.
    pub fn update(
        &self,
        xid: TxnId,
        rid: RecordId,
        op: u16,
        arg: impl Into<Bytes>,
    ) -> TxnResult<Lsn> {
        let arg = arg.into();
        match self.operations.get(op)?.apply {
            Apply::Physical(_) => self.update_with(xid, rid, op, true, |_| Ok(arg)),
            Apply::Logical(apply) => self.update_logical(xid, op, apply, arg),
            Apply::Noop => {
                self.check_writable(xid)?;
                let update = UpdateEntry::logical(op, arg);
                let entry = self.append_update(xid, update, EntryFlags::empty())?;
                Ok(entry.lsn)
            }
        }
    }

    /// Runs a logical operation, then logs it.
    ///
    /// The UPDATE links back past whatever `apply` logged itself, so an
    /// undo runs the inverse once instead of also reversing the inner
    /// updates. If `apply` fails, its inner updates are rolled back and
    /// the chain ends where it started.
    fn update_logical(
        &self,
        xid: TxnId,
        op: u16,
        apply: LogicalFn,
        arg: Bytes,
    ) -> TxnResult<Lsn> {
        self.check_writable(xid)?;
        let start = self.table.lock().get(xid)?.prev_lsn;
        if let Err(err) = apply(self, xid, &arg) {
            let last = self.table.lock().get(xid)?.prev_lsn;
            if last != start {
                self.rollback_to(xid, last, start)?;
            }
            return Err(err);
        }
        let update = UpdateEntry::logical(op, arg);
        let mut entry = LogEntry::new(xid, start, EntryBody::Update(update));
        self.log.write_entry(&mut entry)?;
        self.table.lock().set_prev_lsn(xid, entry.lsn)?;
        TransactionStats::bump(&self.stats.updates);
        Ok(entry.lsn)
    }

    /// Logs and applies a page operation.
    ///
    /// `make_arg` sees the current page image under the write latch, so
    /// arguments that carry a preimage are consistent with what gets
    /// overwritten. The operation runs on a copy of the page first; if it
    /// fails nothing is logged and the page is untouched.
    pub(crate) fn update_with<F>(
        &self,
        xid: TxnId,
        rid: RecordId,
        op: u16,
        lock: bool,
        make_arg: F,
    ) -> TxnResult<Lsn>
    where
        F: FnOnce(&[u8]) -> TxnResult<Bytes>,
    {
        let operation = *self.operations.get(op)?;
        let Apply::Physical(apply) = operation.apply else {
            return Err(TxnError::invalid_argument(format!(
                "operation {} does not edit pages",
                operation.name
            )));
        };
        self.check_writable(xid)?;
        if lock {
            self.write_lock(xid, rid)?;
        }

        let handle = self.pool.load_page(rid.page)?;
        let mut page = handle.write();
        let arg = make_arg(&page)?;
        let mut shadow = page.to_vec();
        apply(&mut shadow, rid, &arg)?;

        let update = UpdateEntry::new(op, rid, arg);
        let entry = self.append_update(xid, update, EntryFlags::empty())?;
        page.copy_from_slice(&shadow);
        page.set_lsn(entry.lsn);
        trace!(%xid, op = operation.name, %rid, lsn = %entry.lsn, "Applied update");
        Ok(entry.lsn)
    }

    /// Writes an entry at the end of `xid`'s chain and advances the chain.
    pub(crate) fn append(&self, xid: TxnId, body: EntryBody) -> TxnResult<LogEntry> {
        self.append_with_flags(xid, body, EntryFlags::empty())
    }

    pub(crate) fn append_update(
        &self,
        xid: TxnId,
        update: UpdateEntry,
        flags: EntryFlags,
    ) -> TxnResult<LogEntry> {
        let entry = self.append_with_flags(xid, EntryBody::Update(update), flags)?;
        TransactionStats::bump(&self.stats.updates);
        Ok(entry)
    }

    fn append_with_flags(
        &self,
        xid: TxnId,
        body: EntryBody,
        flags: EntryFlags,
    ) -> TxnResult<LogEntry> {
        let prev_lsn = self.table.lock().get(xid)?.prev_lsn;
        let mut entry = LogEntry::new(xid, prev_lsn, body).with_flags(flags);
        self.log.write_entry(&mut entry)?;
        self.table.lock().set_prev_lsn(xid, entry.lsn)?;
        Ok(entry)
    }

    fn append_clr(&self, xid: TxnId, clr: ClrEntry) -> TxnResult<LogEntry> {
        let entry = self.append(xid, EntryBody::Clr(clr))?;
        TransactionStats::bump(&self.stats.clrs);
        Ok(entry)
    }

    /// Writes a CLR that compensates nothing physically. Undo continues at
    /// `undo_next`.
    pub(crate) fn append_noop_clr(
        &self,
        xid: TxnId,
        compensated: Lsn,
        undo_next: Lsn,
    ) -> TxnResult<LogEntry> {
        self.append_clr(
            xid,
            ClrEntry {
                compensated,
                undo_next,
                update: UpdateEntry::logical(OperationId::NOOP, Bytes::new()),
            },
        )
    }

    /// Fails unless `xid` may still log updates.
    pub(crate) fn check_writable(&self, xid: TxnId) -> TxnResult<()> {
        self.check_open()?;
        let table = self.table.lock();
        let entry = table.get(xid)?;
        match entry.state {
            TransactionState::Active | TransactionState::Aborting => Ok(()),
            state => Err(TxnError::InvalidState {
                xid,
                state,
                expected: "Active",
            }),
        }
    }

    pub(crate) fn write_lock(&self, xid: TxnId, rid: RecordId) -> TxnResult<()> {
        self.locks
            .write_lock_record(xid, rid)
            .map_err(|err| self.note_lock_error(err))
    }

    pub(crate) fn read_lock(&self, xid: TxnId, rid: RecordId) -> TxnResult<()> {
        self.locks
            .read_lock_record(xid, rid)
            .map_err(|err| self.note_lock_error(err))
    }

    fn note_lock_error(&self, err: TxnError) -> TxnError {
        if err.is_deadlock() {
            TransactionStats::bump(&self.stats.deadlocks);
        }
        err
    }

    /// Undoes `xid`'s updates from `from` back to its BEGIN, following
    /// `prev_lsn` links and jumping over work already compensated.
    pub(crate) fn rollback(&self, xid: TxnId, from: Lsn) -> TxnResult<()> {
        self.rollback_to(xid, from, Lsn::INVALID)
    }

    /// Undoes `xid`'s updates from `from` back to, but not including,
    /// `stop`.
    pub(crate) fn rollback_to(&self, xid: TxnId, from: Lsn, stop: Lsn) -> TxnResult<()> {
        let mut cursor = from;
        while cursor.is_valid() && cursor > stop {
            let entry = self
                .log
                .read_entry(cursor)?
                .ok_or_else(|| TxnError::recovery(cursor, "entry missing from undo chain"))?;
            if entry.xid != xid {
                return Err(TxnError::recovery(
                    cursor,
                    format!("undo chain of {xid} reached an entry of {}", entry.xid),
                ));
            }
            cursor = match &entry.body {
                EntryBody::Begin => break,
                EntryBody::Clr(clr) => clr.undo_next,
                EntryBody::Update(update) => {
                    self.undo_update(&entry, update)?;
                    entry.prev_lsn
                }
                EntryBody::Abort | EntryBody::Prepare { .. } => entry.prev_lsn,
                EntryBody::Commit | EntryBody::End => {
                    return Err(TxnError::recovery(
                        cursor,
                        format!("undo chain of {xid} reached a finished transaction"),
                    ));
                }
            };
        }
        Ok(())
    }

    fn undo_update(&self, entry: &LogEntry, update: &UpdateEntry) -> TxnResult<()> {
        let xid = entry.xid;
        let Some(inverse) = self.operations.undo_of(update.op)?.copied() else {
            return Ok(());
        };
        match inverse.apply {
            Apply::Physical(apply) => {
                let handle = self.pool.load_page(update.rid.page)?;
                let mut page = handle.write();
                let clr = self.append_clr(
                    xid,
                    ClrEntry {
                        compensated: entry.lsn,
                        undo_next: entry.prev_lsn,
                        update: UpdateEntry::new(inverse.id, update.rid, update.arg.clone()),
                    },
                )?;
                apply(&mut page, update.rid, &update.arg)
                    .map_err(|err| TxnError::recovery(entry.lsn, format!("undo failed: {err}")))?;
                page.set_lsn(clr.lsn);
                trace!(%xid, op = inverse.name, rid = %update.rid, lsn = %clr.lsn, "Undid update");
            }
            Apply::Logical(apply) => {
                apply(self, xid, &update.arg)?;
                self.append_noop_clr(xid, entry.lsn, entry.prev_lsn)?;
                trace!(%xid, op = inverse.name, "Undid logical update");
            }
            Apply::Noop => {
                self.append_noop_clr(xid, entry.lsn, entry.prev_lsn)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use stasis_common::config::StasisConfig;
    use stasis_common::types::PageId;
    use stasis_wal::{EntryType, LogScanner};

    use super::*;
    use crate::operations::Operation;
    use crate::operations::physical::delta_arg;

    fn open() -> TransactionManager {
        TransactionManager::open(StasisConfig::for_testing()).unwrap()
    }

    fn read_i32(tm: &TransactionManager, xid: TxnId, rid: RecordId) -> i32 {
        let bytes = tm.read(xid, rid).unwrap();
        i32::from_le_bytes(bytes.try_into().unwrap())
    }

    #[test]
    fn test_failed_operation_logs_nothing() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let rid = tm.alloc(xid, 8).unwrap();
        let before = tm.log().next_available_lsn();

        // An 8-byte record cannot take a 4-byte counter delta.
        let err = tm.update(xid, rid, OperationId::INCREMENT, delta_arg(1));
        assert!(err.is_err());
        assert_eq!(tm.log().next_available_lsn(), before);
        tm.commit(xid).unwrap();
    }

    static INVERSE_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn rid_arg(rid: RecordId) -> Bytes {
        let mut arg = Vec::with_capacity(16);
        arg.extend_from_slice(&rid.page.as_u64().to_le_bytes());
        arg.extend_from_slice(&rid.slot.to_le_bytes());
        arg.extend_from_slice(&rid.size.to_le_bytes());
        Bytes::from(arg)
    }

    fn rid_of(arg: &[u8]) -> RecordId {
        let page = u64::from_le_bytes(arg[..8].try_into().unwrap());
        let slot = u32::from_le_bytes(arg[8..12].try_into().unwrap());
        let size = u32::from_le_bytes(arg[12..16].try_into().unwrap());
        RecordId::new(PageId::new(page), slot, size)
    }

    fn bump_then_refuse(tm: &TransactionManager, xid: TxnId, arg: &[u8]) -> TxnResult<()> {
        tm.increment(xid, rid_of(arg), 5)?;
        Err(TxnError::invalid_argument("refused"))
    }

    fn count_inverse(_: &TransactionManager, _: TxnId, _: &[u8]) -> TxnResult<()> {
        INVERSE_RUNS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn bump(tm: &TransactionManager, xid: TxnId, arg: &[u8]) -> TxnResult<()> {
        tm.increment(xid, rid_of(arg), 5).map(|_| ())
    }

    fn unbump(tm: &TransactionManager, xid: TxnId, arg: &[u8]) -> TxnResult<()> {
        tm.decrement(xid, rid_of(arg), 5).map(|_| ())
    }

    fn open_with_logical_ops() -> TransactionManager {
        TransactionManager::builder(StasisConfig::for_testing())
            .operation(Operation::logical(50, "bump_then_refuse", Some(51), bump_then_refuse))
            .unwrap()
            .operation(Operation::logical(51, "count_inverse", None, count_inverse))
            .unwrap()
            .operation(Operation::logical(52, "bump", Some(53), bump))
            .unwrap()
            .operation(Operation::logical(53, "unbump", None, unbump))
            .unwrap()
            .open()
            .unwrap()
    }

    fn counter(tm: &TransactionManager, value: i32) -> RecordId {
        let xid = tm.begin().unwrap();
        let rid = tm.alloc(xid, 4).unwrap();
        tm.set(xid, rid, &value.to_le_bytes()).unwrap();
        tm.commit(xid).unwrap();
        rid
    }

    #[test]
    fn test_failed_logical_operation_is_never_undone() {
        let tm = open_with_logical_ops();
        let rid = counter(&tm, 10);

        let xid = tm.begin().unwrap();
        let chain = tm.transaction(xid).unwrap().prev_lsn;
        assert!(tm.update(xid, rid, 50, rid_arg(rid)).is_err());
        assert_eq!(read_i32(&tm, xid, rid), 10);

        // The inner increment was compensated; the chain now skips it.
        let last = tm.transaction(xid).unwrap().prev_lsn;
        let clr = tm.log().read_entry(last).unwrap().unwrap();
        assert_eq!(clr.as_clr().unwrap().undo_next, chain);

        tm.abort(xid).unwrap();
        assert_eq!(INVERSE_RUNS.load(Ordering::SeqCst), 0);
        let check = tm.begin().unwrap();
        assert_eq!(read_i32(&tm, check, rid), 10);
        tm.commit(check).unwrap();
    }

    #[test]
    fn test_logical_undo_skips_inner_updates() {
        let tm = open_with_logical_ops();
        let rid = counter(&tm, 10);

        let xid = tm.begin().unwrap();
        let lsn = tm.update(xid, rid, 52, rid_arg(rid)).unwrap();
        assert_eq!(read_i32(&tm, xid, rid), 15);
        let entry = tm.log().read_entry(lsn).unwrap().unwrap();
        assert!(entry.prev_lsn < lsn);
        tm.abort(xid).unwrap();

        // Undone once by the inverse, not again by reversing the increment.
        let check = tm.begin().unwrap();
        assert_eq!(read_i32(&tm, check, rid), 10);
        tm.commit(check).unwrap();
    }

    #[test]
    fn test_page_lsn_tracks_last_update() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let rid = tm.alloc(xid, 4).unwrap();
        let lsn = tm.update(xid, rid, OperationId::INCREMENT, delta_arg(5)).unwrap();
        let handle = tm.buffer_pool().load_page(rid.page).unwrap();
        assert_eq!(handle.lsn(), lsn);
        tm.commit(xid).unwrap();
    }

    #[test]
    fn test_abort_restores_and_writes_clrs() {
        let tm = open();
        let setup = tm.begin().unwrap();
        let rid = tm.alloc(setup, 4).unwrap();
        tm.set(setup, rid, &10i32.to_le_bytes()).unwrap();
        tm.commit(setup).unwrap();

        let xid = tm.begin().unwrap();
        tm.increment(xid, rid, 7).unwrap();
        tm.set(xid, rid, &99i32.to_le_bytes()).unwrap();
        tm.abort(xid).unwrap();

        let check = tm.begin().unwrap();
        assert_eq!(read_i32(&tm, check, rid), 10);
        tm.commit(check).unwrap();

        let clrs: Vec<_> = LogScanner::from_start(tm.log().as_ref())
            .map(|entry| entry.unwrap())
            .filter(|entry| entry.xid == xid && entry.entry_type() == EntryType::Clr)
            .collect();
        assert_eq!(clrs.len(), 2);
        let first = clrs[0].as_clr().unwrap();
        assert_eq!(first.update.op, OperationId::SET_INVERSE);
    }

    #[test]
    fn test_rollback_skips_compensated_work() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let rid = tm.alloc(xid, 4).unwrap();
        tm.increment(xid, rid, 3).unwrap();
        let prev = tm.transaction(xid).unwrap().prev_lsn;

        // Undo once by hand, then abort: the CLR chain must keep the
        // increment from being reversed twice.
        tm.table.lock().get_mut(xid).unwrap().state = TransactionState::Aborting;
        tm.rollback(xid, prev).unwrap();
        let clrs_after_first = tm.stats().clrs.load(std::sync::atomic::Ordering::Relaxed);
        let last = tm.transaction(xid).unwrap().prev_lsn;
        tm.rollback(xid, last).unwrap();
        assert_eq!(
            tm.stats().clrs.load(std::sync::atomic::Ordering::Relaxed),
            clrs_after_first
        );
    }
}
