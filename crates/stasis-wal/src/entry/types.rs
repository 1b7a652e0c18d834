//! Log entry types.

use bytes::Bytes;
use stasis_common::types::{Lsn, PageId, RecordId, TxnId};

use crate::error::{WalError, WalResult};

/// Entry type tag, as stored in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryType {
    /// Transaction started.
    Begin = 1,
    /// Transaction committed.
    Commit = 2,
    /// Transaction started rolling back.
    Abort = 3,
    /// Physical or logical update.
    Update = 4,
    /// Transaction finished; no further entries follow for it.
    End = 6,
    /// Compensation entry written while undoing an update.
    Clr = 7,
    /// Transaction prepared; recovery revives it instead of undoing it.
    Prepare = 8,
}

impl EntryType {
    /// Converts the entry type to a u8.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creates an entry type from a u8.
    pub fn from_u8(value: u8) -> WalResult<Self> {
        match value {
            1 => Ok(Self::Begin),
            2 => Ok(Self::Commit),
            3 => Ok(Self::Abort),
            4 => Ok(Self::Update),
            6 => Ok(Self::End),
            7 => Ok(Self::Clr),
            8 => Ok(Self::Prepare),
            _ => Err(WalError::decode(format!("unknown entry type: {value}"))),
        }
    }
}

bitflags::bitflags! {
    /// Flags for log entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntryFlags: u8 {
        /// The update names no page; redo skips it and undo runs the
        /// inverse operation logically.
        const LOGICAL = 0b0000_0001;
        /// The update opens a nested top action.
        const NESTED_TOP = 0b0000_0010;
    }
}

/// An operation applied to a record (or to nothing, for logical entries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEntry {
    /// Operation id in the operations table.
    pub op: u16,
    /// Target record. `RecordId::INVALID` for logical updates.
    pub rid: RecordId,
    /// Operation argument bytes.
    pub arg: Bytes,
}

impl UpdateEntry {
    /// Creates a physical update against `rid`.
    pub fn new(op: u16, rid: RecordId, arg: impl Into<Bytes>) -> Self {
        Self {
            op,
            rid,
            arg: arg.into(),
        }
    }

    /// Creates a logical update that targets no page.
    pub fn logical(op: u16, arg: impl Into<Bytes>) -> Self {
        Self::new(op, RecordId::INVALID, arg)
    }

    /// Returns the target page, if any.
    pub fn page(&self) -> Option<PageId> {
        self.rid.page.is_valid().then_some(self.rid.page)
    }

    /// Returns true if the update targets no page.
    pub fn is_logical(&self) -> bool {
        !self.rid.page.is_valid()
    }
}

/// A compensation entry.
///
/// Redo applies `update` (the compensating change). Undo never revisits a
/// CLR; it jumps to `undo_next`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClrEntry {
    /// LSN of the entry this one compensates.
    pub compensated: Lsn,
    /// Next entry of the transaction to undo.
    pub undo_next: Lsn,
    /// Change to redo. A no-op operation for logical compensations and
    /// nested top action ends.
    pub update: UpdateEntry,
}

/// Type-specific part of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryBody {
    /// Transaction started.
    Begin,
    /// Transaction committed.
    Commit,
    /// Transaction started rolling back.
    Abort,
    /// Transaction finished.
    End,
    /// Transaction prepared.
    Prepare {
        /// Oldest LSN recovery must keep for this transaction.
        rec_lsn: Lsn,
    },
    /// An update.
    Update(UpdateEntry),
    /// A compensation.
    Clr(ClrEntry),
}

impl EntryBody {
    /// Returns the entry type tag.
    pub fn entry_type(&self) -> EntryType {
        match self {
            Self::Begin => EntryType::Begin,
            Self::Commit => EntryType::Commit,
            Self::Abort => EntryType::Abort,
            Self::End => EntryType::End,
            Self::Prepare { .. } => EntryType::Prepare,
            Self::Update(_) => EntryType::Update,
            Self::Clr(_) => EntryType::Clr,
        }
    }
}

/// A log entry.
///
/// `lsn` is assigned by the log when the entry is written and is not part
/// of the encoded bytes; it is the entry's position in the log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Position of the entry in the log.
    pub lsn: Lsn,
    /// Previous entry of the same transaction.
    pub prev_lsn: Lsn,
    /// Owning transaction.
    pub xid: TxnId,
    /// Flags.
    pub flags: EntryFlags,
    /// Type-specific body.
    pub body: EntryBody,
}

impl LogEntry {
    /// Creates an unwritten entry.
    pub fn new(xid: TxnId, prev_lsn: Lsn, body: EntryBody) -> Self {
        let flags = match &body {
            EntryBody::Update(update) if update.is_logical() => EntryFlags::LOGICAL,
            _ => EntryFlags::empty(),
        };
        Self {
            lsn: Lsn::INVALID,
            prev_lsn,
            xid,
            flags,
            body,
        }
    }

    /// Creates an update entry.
    pub fn update(xid: TxnId, prev_lsn: Lsn, update: UpdateEntry) -> Self {
        Self::new(xid, prev_lsn, EntryBody::Update(update))
    }

    /// Creates a compensation entry.
    pub fn clr(xid: TxnId, prev_lsn: Lsn, clr: ClrEntry) -> Self {
        Self::new(xid, prev_lsn, EntryBody::Clr(clr))
    }

    /// Adds flags.
    #[must_use]
    pub fn with_flags(mut self, flags: EntryFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Returns the entry type.
    pub fn entry_type(&self) -> EntryType {
        self.body.entry_type()
    }

    /// Returns the update carried by an UPDATE entry.
    pub fn as_update(&self) -> Option<&UpdateEntry> {
        match &self.body {
            EntryBody::Update(update) => Some(update),
            _ => None,
        }
    }

    /// Returns the compensation carried by a CLR.
    pub fn as_clr(&self) -> Option<&ClrEntry> {
        match &self.body {
            EntryBody::Clr(clr) => Some(clr),
            _ => None,
        }
    }

    /// Returns the change redo would apply: the update of an UPDATE entry
    /// or the compensating update of a CLR.
    pub fn redo_update(&self) -> Option<&UpdateEntry> {
        match &self.body {
            EntryBody::Update(update) => Some(update),
            EntryBody::Clr(clr) => Some(&clr.update),
            _ => None,
        }
    }

    /// Returns the LSN of the entry that follows this one in the log.
    pub fn next_lsn(&self) -> Lsn {
        self.lsn.advance(super::codec::frame_len(self) as u64)
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} lsn={} prev={} xid={}",
            self.entry_type(),
            self.lsn,
            self.prev_lsn,
            self.xid
        )?;
        if let Some(update) = self.redo_update() {
            write!(f, " op={} rid={}", update.op, update.rid)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_type_numbers() {
        assert_eq!(EntryType::Begin.as_u8(), 1);
        assert_eq!(EntryType::Update.as_u8(), 4);
        assert_eq!(EntryType::End.as_u8(), 6);
        assert_eq!(EntryType::Clr.as_u8(), 7);
        assert_eq!(EntryType::Prepare.as_u8(), 8);
        assert!(EntryType::from_u8(5).is_err());
        assert_eq!(EntryType::from_u8(3).unwrap(), EntryType::Abort);
    }

    #[test]
    fn test_logical_update_flagged() {
        let update = UpdateEntry::logical(37, vec![1]);
        let entry = LogEntry::update(TxnId::new(3), Lsn::new(10), update);
        assert!(entry.flags.contains(EntryFlags::LOGICAL));
        assert_eq!(entry.as_update().unwrap().page(), None);

        let rid = RecordId::new(PageId::new(4), 2, 8);
        let update = UpdateEntry::new(0, rid, vec![1]);
        let entry = LogEntry::update(TxnId::new(3), Lsn::new(10), update);
        assert!(entry.flags.is_empty());
        assert_eq!(entry.as_update().unwrap().page(), Some(PageId::new(4)));
    }

    #[test]
    fn test_redo_update_of_clr() {
        let rid = RecordId::new(PageId::new(1), 0, 4);
        let clr = ClrEntry {
            compensated: Lsn::new(50),
            undo_next: Lsn::new(20),
            update: UpdateEntry::new(1, rid, vec![0; 8]),
        };
        let entry = LogEntry::clr(TxnId::new(1), Lsn::new(70), clr.clone());
        assert_eq!(entry.redo_update(), Some(&clr.update));
        assert!(entry.as_update().is_none());
    }
}
