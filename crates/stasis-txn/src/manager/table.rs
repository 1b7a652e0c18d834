//! Transaction table.
//!
//! # Transaction States
//!
//! ```text
//! ┌───────┐   begin()    ┌────────┐   prepare()   ┌──────────┐
//! │ Start │─────────────▶│ Active │──────────────▶│ Prepared │
//! └───────┘              └────────┘               └──────────┘
//!                          │    │                   │      │
//!                 commit() │    │ abort()  abort()  │      │ commit()
//!                          ▼    ▼                   ▼      ▼
//!               ┌────────────┐ ┌──────────┐
//!               │ Committing │ │ Aborting │   (entry removed at END)
//!               └────────────┘ └──────────┘
//! ```
//!
//! Recovery revives prepared transactions straight into `Prepared`.

use std::collections::HashMap;
use std::fmt;

use stasis_common::types::{Lsn, TxnId};
use stasis_storage::page::BlobRef;

use crate::error::{TxnError, TxnResult};

/// The state of a transaction in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is running and can perform operations.
    Active,
    /// Transaction is prepared and waits for a commit or abort decision.
    Prepared,
    /// COMMIT has been written; the transaction is finishing.
    Committing,
    /// ABORT has been written; the transaction is rolling back.
    Aborting,
}

impl TransactionState {
    /// Returns true if the transaction can perform operations.
    pub fn is_active(&self) -> bool {
        *self == TransactionState::Active
    }

    /// Returns true if the transaction may still be committed or aborted.
    pub fn is_open(&self) -> bool {
        matches!(self, TransactionState::Active | TransactionState::Prepared)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "Active"),
            TransactionState::Prepared => write!(f, "Prepared"),
            TransactionState::Committing => write!(f, "Committing"),
            TransactionState::Aborting => write!(f, "Aborting"),
        }
    }
}

/// One row of the transaction table.
#[derive(Debug, Clone)]
pub struct TransactionEntry {
    /// Transaction id.
    pub xid: TxnId,
    /// LSN of the transaction's most recent log entry.
    pub prev_lsn: Lsn,
    /// Oldest LSN recovery needs for this transaction.
    pub rec_lsn: Lsn,
    /// Current state.
    pub state: TransactionState,
    /// Blobs this transaction created. Released if it aborts.
    pub(crate) new_blobs: Vec<BlobRef>,
    /// Blobs whose records this transaction freed. Released at commit.
    pub(crate) freed_blobs: Vec<BlobRef>,
}

impl TransactionEntry {
    fn new(xid: TxnId, state: TransactionState) -> Self {
        Self {
            xid,
            prev_lsn: Lsn::INVALID,
            rec_lsn: Lsn::INVALID,
            state,
            new_blobs: Vec::new(),
            freed_blobs: Vec::new(),
        }
    }
}

/// Fixed-capacity map of live transactions.
#[derive(Debug)]
pub(crate) struct TransactionTable {
    entries: HashMap<TxnId, TransactionEntry>,
    capacity: usize,
    next_xid: u64,
}

impl TransactionTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            next_xid: TxnId::MIN.as_u64(),
        }
    }

    /// Reserves a fresh xid and an Active row for it.
    pub(crate) fn insert_new(&mut self) -> TxnResult<TxnId> {
        if self.entries.len() >= self.capacity {
            return Err(TxnError::TooManyTransactions {
                limit: self.capacity,
            });
        }
        let xid = TxnId::new(self.next_xid);
        self.next_xid += 1;
        self.entries
            .insert(xid, TransactionEntry::new(xid, TransactionState::Active));
        Ok(xid)
    }

    /// Reinstates a transaction found in the log.
    pub(crate) fn revive(
        &mut self,
        xid: TxnId,
        prev_lsn: Lsn,
        rec_lsn: Lsn,
        state: TransactionState,
    ) -> TxnResult<()> {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&xid) {
            return Err(TxnError::TooManyTransactions {
                limit: self.capacity,
            });
        }
        self.observe_xid(xid);
        let entry = self
            .entries
            .entry(xid)
            .or_insert_with(|| TransactionEntry::new(xid, state));
        entry.prev_lsn = prev_lsn;
        entry.rec_lsn = rec_lsn;
        entry.state = state;
        Ok(())
    }

    /// Makes sure future xids are above `xid`.
    pub(crate) fn observe_xid(&mut self, xid: TxnId) {
        self.next_xid = self.next_xid.max(xid.as_u64() + 1);
    }

    pub(crate) fn get(&self, xid: TxnId) -> TxnResult<&TransactionEntry> {
        self.entries.get(&xid).ok_or(TxnError::NotFound { xid })
    }

    pub(crate) fn get_mut(&mut self, xid: TxnId) -> TxnResult<&mut TransactionEntry> {
        self.entries.get_mut(&xid).ok_or(TxnError::NotFound { xid })
    }

    /// Returns the entry if the transaction is in `expected`.
    pub(crate) fn expect_state(
        &mut self,
        xid: TxnId,
        allowed: fn(&TransactionState) -> bool,
        expected: &'static str,
    ) -> TxnResult<&mut TransactionEntry> {
        let entry = self.get_mut(xid)?;
        if !allowed(&entry.state) {
            return Err(TxnError::InvalidState {
                xid,
                state: entry.state,
                expected,
            });
        }
        Ok(entry)
    }

    /// Records that `lsn` is now the transaction's latest entry.
    pub(crate) fn set_prev_lsn(&mut self, xid: TxnId, lsn: Lsn) -> TxnResult<()> {
        let entry = self.get_mut(xid)?;
        entry.prev_lsn = lsn;
        if !entry.rec_lsn.is_valid() {
            entry.rec_lsn = lsn;
        }
        Ok(())
    }

    pub(crate) fn remove(&mut self, xid: TxnId) -> Option<TransactionEntry> {
        self.entries.remove(&xid)
    }

    pub(crate) fn contains(&self, xid: TxnId) -> bool {
        self.entries.contains_key(&xid)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Live transactions in xid order.
    pub(crate) fn snapshot(&self) -> Vec<TransactionEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.xid);
        entries
    }

    /// Oldest recovery LSN across live transactions.
    pub(crate) fn min_rec_lsn(&self) -> Option<Lsn> {
        self.entries
            .values()
            .map(|entry| entry.rec_lsn)
            .filter(|lsn| lsn.is_valid())
            .min()
    }
}
