//! # stasis-txn
//!
//! Transactions, recovery and allocation for the Stasis storage engine.
//!
//! This crate turns the page store and the log into a transactional
//! record store:
//!
//! - **Transactions**: begin, commit, abort, prepare, with write-ahead
//!   logging of every page change and CLR-based rollback.
//!
//! - **Operations**: a table of redo/undo functions that every logged update
//!   names by id. Applications can register their own.
//!
//! - **Nested top actions**: groups of updates that outlive an abort of
//!   the transaction that ran them, rolled back by a logical inverse.
//!
//! - **Recovery**: analysis, redo, and undo from the log on open. Prepared
//!   transactions are revived.
//!
//! - **Allocation**: a boundary-tag region allocator for contiguous pages,
//!   a record allocator on slotted pages, pre-sized record arrays and
//!   growable array lists.
//!
//! - **Locking**: an optional page lock manager with deadlock detection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     TransactionManager                       │
//! │                                                              │
//! │  ┌──────────────┐   ┌───────────────┐   ┌────────────────┐   │
//! │  │ Transaction  │   │  Operations   │   │  LockManager   │   │
//! │  │    table     │   │    table      │   │ (+ wait-for)   │   │
//! │  └──────────────┘   └───────────────┘   └────────────────┘   │
//! │  ┌──────────────┐   ┌───────────────┐   ┌────────────────┐   │
//! │  │   Regions    │◀──│    Talloc     │   │   BlobStore    │   │
//! │  └──────────────┘   └───────────────┘   └────────────────┘   │
//! │          │                  │                                │
//! │          ▼                  ▼                                │
//! │  ┌──────────────────────────────────┐   ┌────────────────┐   │
//! │  │    BufferPool (stasis-storage)   │──▶│ Log (stasis-wal)│  │
//! │  └──────────────────────────────────┘   └────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use stasis_common::config::StasisConfig;
//! use stasis_txn::TransactionManager;
//!
//! let tm = TransactionManager::open(StasisConfig::for_testing())?;
//! let xid = tm.begin()?;
//! let rid = tm.alloc(xid, 5)?;
//! tm.set(xid, rid, b"hello")?;
//! tm.commit(xid)?;
//!
//! let xid = tm.begin()?;
//! assert_eq!(tm.read(xid, rid)?, b"hello");
//! tm.commit(xid)?;
//! tm.shutdown()?;
//! # Ok::<(), stasis_txn::TxnError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod alloc;
mod array_list;
mod error;
mod indirect;
mod nta;
mod recovery;

/// Transaction manager and transaction table.
pub mod manager;

/// Operations table and the built-in operations.
pub mod operations;

/// Boundary-tag region allocator.
pub mod region;

/// Out-of-line storage for large records.
pub mod blob;

/// Page lock manager.
pub mod lock;

/// Deadlock detection.
pub mod deadlock;

pub use blob::{BlobStore, MemoryBlobStore};
pub use deadlock::{DeadlockInfo, DeadlockStats, WaitForGraph};
pub use error::{TxnError, TxnResult};
pub use lock::{
    LockManager, LockManagerConfig, LockMode, LockStats, LockTarget, NoLockManager, PageLockManager,
};
pub use manager::{
    TransactionEntry, TransactionManager, TransactionManagerBuilder, TransactionState,
    TransactionStats,
};
pub use nta::NestedAction;
pub use operations::{Apply, LogicalFn, Operation, OperationId, OperationTable, PhysicalFn};
pub use region::{BoundaryTag, RegionGuard, RegionReport, RegionStatus};
