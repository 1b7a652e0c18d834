//! Nested top actions.
//!
//! A nested top action groups updates that must survive even if the
//! enclosing transaction aborts, such as the bookkeeping of the region
//! allocator. Its begin entry is a logical UPDATE whose operation names the
//! inverse to run if the enclosing transaction rolls back; its end entry is
//! a CLR whose `undo_next` points back at the begin entry:
//!
//! ```text
//!  BEGIN-NTA(op)  upd  upd  upd  END-NTA(CLR, undo_next = BEGIN-NTA)
//!       ▲                              │
//!       └──────────────────────────────┘
//! ```
//!
//! Undo therefore skips the inner physical updates and runs `op`'s logical
//! inverse once. A crash before the end entry undoes the inner updates one
//! by one instead.

use bytes::Bytes;
use tracing::warn;

use stasis_common::types::{Lsn, TxnId};
use stasis_wal::{EntryFlags, UpdateEntry};

use crate::error::{TxnError, TxnResult};
use crate::manager::TransactionManager;
use crate::operations::Apply;

/// An open nested top action.
///
/// The end entry is written by [`NestedAction::end`] or, failing that, when
/// the guard is dropped.
#[must_use = "a nested top action ends when the guard is dropped"]
pub struct NestedAction<'a> {
    tm: &'a TransactionManager,
    xid: TxnId,
    begin_lsn: Lsn,
    open: bool,
}

impl<'a> NestedAction<'a> {
    pub(crate) fn begin(
        tm: &'a TransactionManager,
        xid: TxnId,
        op: u16,
        arg: impl Into<Bytes>,
    ) -> TxnResult<Self> {
        tm.check_writable(xid)?;
        let operation = tm.operations.get(op)?;
        if operation.is_physical() {
            return Err(TxnError::invalid_argument(format!(
                "{} cannot open a nested top action",
                operation.name
            )));
        }
        let entry = tm.append_update(xid, UpdateEntry::logical(op, arg), EntryFlags::NESTED_TOP)?;
        Ok(Self {
            tm,
            xid,
            begin_lsn: entry.lsn,
            open: true,
        })
    }

    /// The transaction the action belongs to.
    pub fn xid(&self) -> TxnId {
        self.xid
    }

    /// LSN of the begin entry.
    pub fn begin_lsn(&self) -> Lsn {
        self.begin_lsn
    }

    /// Writes the end entry. Returns its LSN.
    pub fn end(mut self) -> TxnResult<Lsn> {
        self.open = false;
        self.write_end()
    }

    fn write_end(&self) -> TxnResult<Lsn> {
        let entry = self
            .tm
            .append_noop_clr(self.xid, self.begin_lsn, self.begin_lsn)?;
        Ok(entry.lsn)
    }
}

impl Drop for NestedAction<'_> {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            if let Err(err) = self.write_end() {
                warn!(
                    xid = %self.xid,
                    begin = %self.begin_lsn,
                    error = %err,
                    "Failed to end nested top action"
                );
            }
        }
    }
}

impl std::fmt::Debug for NestedAction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestedAction")
            .field("xid", &self.xid)
            .field("begin_lsn", &self.begin_lsn)
            .field("open", &self.open)
            .finish()
    }
}

impl TransactionManager {
    /// Opens a nested top action whose rollback runs `op`'s inverse.
    ///
    /// `op` must be a logical or marker operation; use
    /// [`crate::OperationId::NOOP`] for an action that needs no logical
    /// undo.
    pub fn begin_nested_top_action(
        &self,
        xid: TxnId,
        op: u16,
        arg: impl Into<Bytes>,
    ) -> TxnResult<NestedAction<'_>> {
        NestedAction::begin(self, xid, op, arg)
    }

    /// Runs a single logical operation as a nested top action.
    pub fn nested_top_action(&self, xid: TxnId, op: u16, arg: impl Into<Bytes>) -> TxnResult<Lsn> {
        let arg = arg.into();
        let action = NestedAction::begin(self, xid, op, arg.clone())?;
        if let Apply::Logical(apply) = self.operations.get(op)?.apply {
            apply(self, xid, &arg)?;
        }
        action.end()
    }
}

#[cfg(test)]
mod tests {
    use stasis_common::config::StasisConfig;
    use stasis_wal::{EntryBody, EntryType, LogScanner};

    use super::*;
    use crate::operations::OperationId;

    fn open() -> TransactionManager {
        TransactionManager::open(StasisConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_end_entry_points_at_begin() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let action = tm
            .begin_nested_top_action(xid, OperationId::NOOP, Bytes::new())
            .unwrap();
        let begin = action.begin_lsn();
        let end = action.end().unwrap();

        let entry = tm.log().read_entry(end).unwrap().unwrap();
        let EntryBody::Clr(clr) = entry.body else {
            panic!("end entry is not a CLR");
        };
        assert_eq!(clr.undo_next, begin);
        let begin_entry = tm.log().read_entry(begin).unwrap().unwrap();
        assert!(begin_entry.flags.contains(EntryFlags::NESTED_TOP));
        tm.commit(xid).unwrap();
    }

    #[test]
    fn test_drop_writes_end() {
        let tm = open();
        let xid = tm.begin().unwrap();
        {
            let _action = tm
                .begin_nested_top_action(xid, OperationId::NOOP, Bytes::new())
                .unwrap();
        }
        let last = tm.transaction(xid).unwrap().prev_lsn;
        let entry = tm.log().read_entry(last).unwrap().unwrap();
        assert_eq!(entry.entry_type(), EntryType::Clr);
        tm.commit(xid).unwrap();
    }

    #[test]
    fn test_inner_updates_survive_abort() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let rid = tm.alloc(xid, 4).unwrap();
        tm.set(xid, rid, &1i32.to_le_bytes()).unwrap();
        tm.commit(xid).unwrap();

        let xid = tm.begin().unwrap();
        {
            let action = tm
                .begin_nested_top_action(xid, OperationId::NOOP, Bytes::new())
                .unwrap();
            tm.increment(xid, rid, 41).unwrap();
            action.end().unwrap();
        }
        tm.increment(xid, rid, 100).unwrap();
        tm.abort(xid).unwrap();

        let check = tm.begin().unwrap();
        assert_eq!(tm.read(check, rid).unwrap(), 42i32.to_le_bytes());
        tm.commit(check).unwrap();

        let clrs = LogScanner::from_start(tm.log().as_ref())
            .map(|entry| entry.unwrap())
            .filter(|entry| entry.xid == xid && entry.entry_type() == EntryType::Clr)
            .count();
        // The nested action's end plus the compensation of the outer
        // increment.
        assert_eq!(clrs, 2);
    }

    #[test]
    fn test_physical_operation_cannot_open_action() {
        let tm = open();
        let xid = tm.begin().unwrap();
        assert!(matches!(
            tm.begin_nested_top_action(xid, OperationId::SET, Bytes::new()),
            Err(TxnError::InvalidArgument { .. })
        ));
        tm.commit(xid).unwrap();
    }
}
