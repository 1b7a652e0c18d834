//! Operations table.
//!
//! Every logged update names an operation by id. The log and recovery code
//! only know how to look an operation up and run it; what an operation does
//! to a page is defined here.
//!
//! ```text
//!  UPDATE entry { op, rid, arg }
//!        │
//!        ▼
//!  OperationTable[op] ──▶ Operation { redo, undo, apply }
//!                                            │
//!                 ┌──────────────────────────┼───────────────────┐
//!                 ▼                          ▼                   ▼
//!        Physical(page, rid, arg)   Logical(tm, xid, arg)       Noop
//!        under the page latch       runs T* calls
//! ```
//!
//! A physical operation is redone whenever the page LSN is older than the
//! entry. Logical operations are never redone; their effects are carried
//! by the physical updates they log themselves.

pub mod physical;

use std::fmt;

use stasis_common::constants::MAX_OPERATIONS;
use stasis_common::types::{RecordId, TxnId};
use stasis_storage::page::PageResult;

use crate::error::{TxnError, TxnResult};
use crate::manager::TransactionManager;
use crate::region;

/// Applies an operation to a page image.
pub type PhysicalFn = fn(&mut [u8], RecordId, &[u8]) -> PageResult<()>;

/// Applies an operation through the transaction manager.
pub type LogicalFn = fn(&TransactionManager, TxnId, &[u8]) -> TxnResult<()>;

/// Numbering of the built-in operations.
///
/// The numbers are stored in the log and must not change.
#[derive(Debug)]
pub struct OperationId;

impl OperationId {
    /// Overwrites a record. Argument: new value followed by old value.
    pub const SET: u16 = 0;
    /// Restores the old value of a [`OperationId::SET`].
    pub const SET_INVERSE: u16 = 1;
    /// Adds an `i32` delta to a 4-byte record.
    pub const INCREMENT: u16 = 2;
    /// Subtracts an `i32` delta from a 4-byte record.
    pub const DECREMENT: u16 = 3;
    /// Claims a slot.
    pub const ALLOC: u16 = 4;
    /// Frees a slot. Argument: the record's stored bytes.
    pub const DEALLOC: u16 = 8;
    /// Reclaims a freed slot and restores its bytes.
    pub const REALLOC: u16 = 9;
    /// Overwrites a byte range of a page.
    pub const PAGE_SET_RANGE: u16 = 10;
    /// Restores the old bytes of a [`OperationId::PAGE_SET_RANGE`].
    pub const PAGE_SET_RANGE_INVERSE: u16 = 11;
    /// Does nothing.
    pub const NOOP: u16 = 19;
    /// Formats an array list header page.
    pub const ARRAY_LIST_ALLOC: u16 = 21;
    /// Formats a page. The record id carries the page type in `slot` and
    /// the record size in `size`.
    pub const INITIALIZE_PAGE: u16 = 22;
    /// Formats a boundary tag page and writes its tag.
    pub const ALLOC_BOUNDARY_TAG: u16 = 35;
    /// Opens the nested top action of a region allocation.
    pub const ALLOC_REGION: u16 = 37;
    /// Releases a region whose allocation is being undone.
    pub const ALLOC_REGION_INVERSE: u16 = 38;
    /// Opens the nested top action of a region deallocation.
    pub const DEALLOC_REGION: u16 = 39;
    /// Re-zones a region whose deallocation is being undone.
    pub const DEALLOC_REGION_INVERSE: u16 = 40;
}

/// How an operation changes state.
#[derive(Clone, Copy)]
pub enum Apply {
    /// Page-level change, run under the page's write latch.
    Physical(PhysicalFn),
    /// Change expressed as transactional calls against the manager.
    Logical(LogicalFn),
    /// Marker operation with no effect of its own.
    Noop,
}

impl fmt::Debug for Apply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Physical(_) => f.write_str("Physical"),
            Self::Logical(_) => f.write_str("Logical"),
            Self::Noop => f.write_str("Noop"),
        }
    }
}

/// An entry of the operations table.
#[derive(Debug, Clone, Copy)]
pub struct Operation {
    /// Id stored in log entries.
    pub id: u16,
    /// Name for diagnostics.
    pub name: &'static str,
    /// Operation run when recovery redoes an entry of this operation.
    pub redo: u16,
    /// Operation that compensates this one, or `None` for redo-only
    /// operations.
    pub undo: Option<u16>,
    /// Behavior.
    pub apply: Apply,
}

impl Operation {
    /// A page-level operation that redoes itself.
    pub const fn physical(
        id: u16,
        name: &'static str,
        undo: Option<u16>,
        apply: PhysicalFn,
    ) -> Self {
        Self {
            id,
            name,
            redo: id,
            undo,
            apply: Apply::Physical(apply),
        }
    }

    /// A logical operation. Redo skips it.
    pub const fn logical(id: u16, name: &'static str, undo: Option<u16>, apply: LogicalFn) -> Self {
        Self {
            id,
            name,
            redo: OperationId::NOOP,
            undo,
            apply: Apply::Logical(apply),
        }
    }

    /// A marker operation, typically the begin entry of a nested top action.
    pub const fn marker(id: u16, name: &'static str, undo: Option<u16>) -> Self {
        Self {
            id,
            name,
            redo: OperationId::NOOP,
            undo,
            apply: Apply::Noop,
        }
    }

    /// Returns true if the operation edits a page directly.
    pub fn is_physical(&self) -> bool {
        matches!(self.apply, Apply::Physical(_))
    }
}

/// Dispatch table from operation id to [`Operation`].
#[derive(Debug, Clone)]
pub struct OperationTable {
    ops: Vec<Option<Operation>>,
}

impl OperationTable {
    /// Creates an empty table.
    pub fn empty() -> Self {
        Self {
            ops: vec![None; MAX_OPERATIONS],
        }
    }

    /// Creates a table holding the built-in operations.
    pub fn builtin() -> Self {
        use physical as p;
        use OperationId as Id;

        let mut table = Self::empty();
        let builtins = [
            Operation::physical(Id::SET, "SET", Some(Id::SET_INVERSE), p::set),
            Operation::physical(Id::SET_INVERSE, "SET_INVERSE", Some(Id::SET), p::set_inverse),
            Operation::physical(Id::INCREMENT, "INCREMENT", Some(Id::DECREMENT), p::increment),
            Operation::physical(Id::DECREMENT, "DECREMENT", Some(Id::INCREMENT), p::decrement),
            Operation::physical(Id::ALLOC, "ALLOC", Some(Id::DEALLOC), p::alloc),
            Operation::physical(Id::DEALLOC, "DEALLOC", Some(Id::REALLOC), p::dealloc),
            Operation::physical(Id::REALLOC, "REALLOC", Some(Id::DEALLOC), p::realloc),
            Operation::physical(
                Id::PAGE_SET_RANGE,
                "PAGE_SET_RANGE",
                Some(Id::PAGE_SET_RANGE_INVERSE),
                p::page_set_range,
            ),
            Operation::physical(
                Id::PAGE_SET_RANGE_INVERSE,
                "PAGE_SET_RANGE_INVERSE",
                Some(Id::PAGE_SET_RANGE),
                p::page_set_range_inverse,
            ),
            Operation::marker(Id::NOOP, "NOOP", None),
            Operation::physical(
                Id::ARRAY_LIST_ALLOC,
                "ARRAY_LIST_ALLOC",
                Some(Id::NOOP),
                p::array_list_alloc,
            ),
            Operation::physical(
                Id::INITIALIZE_PAGE,
                "INITIALIZE_PAGE",
                Some(Id::NOOP),
                p::initialize_page,
            ),
            Operation::physical(
                Id::ALLOC_BOUNDARY_TAG,
                "ALLOC_BOUNDARY_TAG",
                None,
                p::alloc_boundary_tag,
            ),
            Operation::marker(Id::ALLOC_REGION, "ALLOC_REGION", Some(Id::ALLOC_REGION_INVERSE)),
            Operation::logical(
                Id::ALLOC_REGION_INVERSE,
                "ALLOC_REGION_INVERSE",
                None,
                region::undo_region_alloc,
            ),
            Operation::marker(
                Id::DEALLOC_REGION,
                "DEALLOC_REGION",
                Some(Id::DEALLOC_REGION_INVERSE),
            ),
            Operation::logical(
                Id::DEALLOC_REGION_INVERSE,
                "DEALLOC_REGION_INVERSE",
                None,
                region::undo_region_dealloc,
            ),
        ];
        for op in builtins {
            table.ops[usize::from(op.id)] = Some(op);
        }
        table
    }

    /// Adds an operation.
    ///
    /// Fails if the id is beyond the table capacity or already taken.
    pub fn register(&mut self, op: Operation) -> TxnResult<()> {
        let slot = self
            .ops
            .get_mut(usize::from(op.id))
            .ok_or(TxnError::Registration {
                op: op.id,
                reason: "id exceeds the table capacity",
            })?;
        if slot.is_some() {
            return Err(TxnError::Registration {
                op: op.id,
                reason: "id is already registered",
            });
        }
        *slot = Some(op);
        Ok(())
    }

    /// Looks an operation up.
    pub fn get(&self, id: u16) -> TxnResult<&Operation> {
        self.ops
            .get(usize::from(id))
            .and_then(Option::as_ref)
            .ok_or(TxnError::UnknownOperation { op: id })
    }

    /// The operation recovery runs to redo `id`.
    pub fn redo_of(&self, id: u16) -> TxnResult<&Operation> {
        let op = self.get(id)?;
        self.get(op.redo)
    }

    /// The compensating operation of `id`, if it has one.
    pub fn undo_of(&self, id: u16) -> TxnResult<Option<&Operation>> {
        match self.get(id)?.undo {
            Some(undo) => self.get(undo).map(Some),
            None => Ok(None),
        }
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.ops.iter().filter(|op| op.is_some()).count()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OperationTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_page(_page: &mut [u8], _rid: RecordId, _arg: &[u8]) -> PageResult<()> {
        Ok(())
    }

    #[test]
    fn test_builtin_inverses_pair_up() {
        let table = OperationTable::builtin();
        for (forward, inverse) in [
            (OperationId::SET, OperationId::SET_INVERSE),
            (OperationId::INCREMENT, OperationId::DECREMENT),
            (OperationId::PAGE_SET_RANGE, OperationId::PAGE_SET_RANGE_INVERSE),
        ] {
            assert_eq!(table.undo_of(forward).unwrap().unwrap().id, inverse);
            assert_eq!(table.undo_of(inverse).unwrap().unwrap().id, forward);
        }
        assert_eq!(
            table.undo_of(OperationId::DEALLOC).unwrap().unwrap().id,
            OperationId::REALLOC
        );
        assert!(table.undo_of(OperationId::ALLOC_BOUNDARY_TAG).unwrap().is_none());
    }

    #[test]
    fn test_logical_operations_are_not_redone() {
        let table = OperationTable::builtin();
        let redo = table.redo_of(OperationId::ALLOC_REGION_INVERSE).unwrap();
        assert_eq!(redo.id, OperationId::NOOP);
        assert!(table.redo_of(OperationId::SET).unwrap().is_physical());
    }

    #[test]
    fn test_register_custom_operation() {
        let mut table = OperationTable::builtin();
        let before = table.len();
        table
            .register(Operation::physical(60, "CUSTOM", None, noop_page))
            .unwrap();
        assert_eq!(table.len(), before + 1);
        assert_eq!(table.get(60).unwrap().name, "CUSTOM");

        let dup = table.register(Operation::physical(60, "AGAIN", None, noop_page));
        assert!(matches!(dup, Err(TxnError::Registration { op: 60, .. })));

        let too_big = table.register(Operation::physical(200, "BIG", None, noop_page));
        assert!(too_big.is_err());
    }

    #[test]
    fn test_unknown_operation() {
        let table = OperationTable::builtin();
        assert!(matches!(
            table.get(55),
            Err(TxnError::UnknownOperation { op: 55 })
        ));
    }
}
