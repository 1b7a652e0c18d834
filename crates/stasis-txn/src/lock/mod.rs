//! Lock management for transaction isolation.
//!
//! The transaction manager calls a [`LockManager`] around every update and
//! read. Two implementations are provided:
//! - [`NoLockManager`]: grants everything (the default)
//! - [`PageLockManager`]: strict two-phase page locks with shared (S) and
//!   exclusive (X) modes, S to X upgrade, and deadlock detection
//!
//! # Lock Compatibility Matrix
//!
//! ```text
//!          │ S  │ X  │
//! ─────────┼────┼────┤
//!     S    │ ✓  │ ✗  │
//!     X    │ ✗  │ ✗  │
//! ```
//!
//! A blocked request waits on a condition variable. Before each wait the
//! requester's edges in the wait-for graph are refreshed; if they close a
//! cycle, or the lock timeout expires, the request fails with
//! [`TxnError::Deadlock`] and the caller must abort.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use stasis_common::config::LockConfig;
use stasis_common::types::{PageId, RecordId, TxnId};
use tracing::{debug, warn};

use crate::deadlock::WaitForGraph;
use crate::error::{TxnError, TxnResult};

/// Lock mode for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared lock (read lock).
    Shared,
    /// Exclusive lock (write lock).
    Exclusive,
}

impl LockMode {
    /// Checks if this lock mode is compatible with another.
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }

    /// Returns the stronger of two lock modes.
    pub fn stronger(self, other: LockMode) -> LockMode {
        if self == LockMode::Exclusive || other == LockMode::Exclusive {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        }
    }

    /// Returns true if holding `self` satisfies a request for `wanted`.
    pub fn covers(self, wanted: LockMode) -> bool {
        self == LockMode::Exclusive || wanted == LockMode::Shared
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
        }
    }
}

/// What a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockTarget {
    /// A whole page.
    Page(PageId),
    /// A single record.
    Record(PageId, u32),
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTarget::Page(page) => write!(f, "Page({})", page),
            LockTarget::Record(page, slot) => write!(f, "Record({}, {})", page, slot),
        }
    }
}

/// Lock callbacks invoked by the transaction manager.
///
/// Any acquisition may fail with [`TxnError::Deadlock`].
pub trait LockManager: Send + Sync + fmt::Debug {
    /// A transaction started.
    fn begin(&self, _xid: TxnId) {}

    /// A transaction committed; release its locks.
    fn commit(&self, xid: TxnId);

    /// A transaction aborted; release its locks.
    fn abort(&self, xid: TxnId);

    /// Takes a shared lock on a page.
    fn read_lock_page(&self, xid: TxnId, page: PageId) -> TxnResult<()>;

    /// Takes an exclusive lock on a page.
    fn write_lock_page(&self, xid: TxnId, page: PageId) -> TxnResult<()>;

    /// Takes a shared lock on a record.
    fn read_lock_record(&self, xid: TxnId, rid: RecordId) -> TxnResult<()>;

    /// Takes an exclusive lock on a record.
    fn write_lock_record(&self, xid: TxnId, rid: RecordId) -> TxnResult<()>;
}

/// Lock manager that grants every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLockManager;

impl LockManager for NoLockManager {
    fn commit(&self, _xid: TxnId) {}

    fn abort(&self, _xid: TxnId) {}

    fn read_lock_page(&self, _xid: TxnId, _page: PageId) -> TxnResult<()> {
        Ok(())
    }

    fn write_lock_page(&self, _xid: TxnId, _page: PageId) -> TxnResult<()> {
        Ok(())
    }

    fn read_lock_record(&self, _xid: TxnId, _rid: RecordId) -> TxnResult<()> {
        Ok(())
    }

    fn write_lock_record(&self, _xid: TxnId, _rid: RecordId) -> TxnResult<()> {
        Ok(())
    }
}

/// Information about a held lock.
#[derive(Debug)]
pub struct LockInfo {
    /// Current lock mode.
    pub mode: LockMode,
    /// Transactions holding the lock.
    pub holders: HashSet<TxnId>,
}

impl LockInfo {
    /// Creates a lock nobody holds.
    pub fn new() -> Self {
        Self {
            mode: LockMode::Shared,
            holders: HashSet::new(),
        }
    }

    /// Returns true if `txn_id` already holds the lock in a mode that
    /// covers `mode`.
    pub fn is_held(&self, txn_id: TxnId, mode: LockMode) -> bool {
        self.holders.contains(&txn_id) && self.mode.covers(mode)
    }

    /// Checks if a lock mode can be granted.
    pub fn can_grant(&self, txn_id: TxnId, mode: LockMode) -> bool {
        if self.holders.is_empty() {
            return true;
        }
        // Sole holder may upgrade.
        if self.holders.len() == 1 && self.holders.contains(&txn_id) {
            return true;
        }
        mode.is_compatible_with(&self.mode)
    }

    /// Grants a lock to a transaction.
    pub fn grant(&mut self, txn_id: TxnId, mode: LockMode) {
        if self.holders.is_empty() {
            self.mode = mode;
        } else {
            self.mode = self.mode.stronger(mode);
        }
        self.holders.insert(txn_id);
    }

    /// Releases a lock held by a transaction.
    pub fn release(&mut self, txn_id: TxnId) -> bool {
        self.holders.remove(&txn_id)
    }

    /// Returns true if the lock is free.
    pub fn is_free(&self) -> bool {
        self.holders.is_empty()
    }
}

impl Default for LockInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the lock manager.
#[derive(Debug, Default)]
pub struct LockStats {
    /// Total lock acquisitions.
    pub acquisitions: AtomicU64,
    /// Total lock releases.
    pub releases: AtomicU64,
    /// Total lock waits.
    pub waits: AtomicU64,
    /// Total deadlocks detected.
    pub deadlocks: AtomicU64,
    /// Total lock upgrades.
    pub upgrades: AtomicU64,
    /// Total timeouts.
    pub timeouts: AtomicU64,
}

impl LockStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

/// Configuration for the lock manager.
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// How long a request may wait before it is treated as a deadlock.
    pub lock_timeout: Duration,
    /// Whether to look for wait-for cycles before waiting.
    pub deadlock_detection: bool,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for LockManagerConfig {
    fn from(config: &LockConfig) -> Self {
        Self {
            lock_timeout: config.timeout(),
            deadlock_detection: true,
        }
    }
}

#[derive(Debug, Default)]
struct LockTable {
    locks: HashMap<LockTarget, LockInfo>,
    txn_locks: HashMap<TxnId, HashSet<LockTarget>>,
    wait_for: WaitForGraph,
}

/// Strict two-phase page lock manager.
///
/// Record lock requests lock the record's page.
pub struct PageLockManager {
    state: Mutex<LockTable>,
    released: Condvar,
    config: LockManagerConfig,
    stats: LockStats,
}

impl PageLockManager {
    /// Creates a lock manager with default configuration.
    pub fn new() -> Self {
        Self::with_config(LockManagerConfig::default())
    }

    /// Creates a lock manager with custom configuration.
    pub fn with_config(config: LockManagerConfig) -> Self {
        Self {
            state: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            config,
            stats: LockStats::new(),
        }
    }

    /// Acquires a lock, blocking until it is granted, a deadlock is found
    /// or the timeout expires.
    pub fn lock(&self, xid: TxnId, target: LockTarget, mode: LockMode) -> TxnResult<()> {
        let deadline = Instant::now() + self.config.lock_timeout;
        let mut state = self.state.lock();
        let mut waited = false;

        loop {
            let table = &mut *state;
            let info = table.locks.entry(target).or_default();
            if info.is_held(xid, mode) {
                return Ok(());
            }

            if info.can_grant(xid, mode) {
                let upgrade = info.holders.contains(&xid);
                info.grant(xid, mode);
                table.txn_locks.entry(xid).or_default().insert(target);
                table.wait_for.clear_waits(xid);
                if upgrade {
                    LockStats::bump(&self.stats.upgrades);
                } else {
                    LockStats::bump(&self.stats.acquisitions);
                }
                return Ok(());
            }

            if !waited {
                LockStats::bump(&self.stats.waits);
                waited = true;
            }
            table.wait_for.clear_waits(xid);
            for &holder in &info.holders {
                table.wait_for.add_wait(xid, holder);
            }

            if self.config.deadlock_detection {
                if let Some(cycle) = table.wait_for.detect_deadlock(xid) {
                    table.wait_for.clear_waits(xid);
                    LockStats::bump(&self.stats.deadlocks);
                    warn!(%xid, %target, %mode, cycle = ?cycle.cycle, "deadlock detected");
                    return Err(TxnError::Deadlock { xid });
                }
            }

            debug!(%xid, %target, %mode, "waiting for lock");
            if self.released.wait_until(&mut state, deadline).timed_out() {
                state.wait_for.clear_waits(xid);
                LockStats::bump(&self.stats.timeouts);
                warn!(%xid, %target, %mode, "lock wait timed out");
                return Err(TxnError::Deadlock { xid });
            }
        }
    }

    /// Releases all locks held by a transaction.
    pub fn release_all(&self, xid: TxnId) -> usize {
        let mut state = self.state.lock();
        let table = &mut *state;
        let targets = table.txn_locks.remove(&xid).unwrap_or_default();
        for target in &targets {
            if let Some(info) = table.locks.get_mut(target) {
                if info.release(xid) {
                    LockStats::bump(&self.stats.releases);
                }
                if info.is_free() {
                    table.locks.remove(target);
                }
            }
        }
        table.wait_for.remove_txn(xid);
        drop(state);

        self.released.notify_all();
        targets.len()
    }

    /// Returns statistics about the lock manager.
    pub fn stats(&self) -> &LockStats {
        &self.stats
    }

    /// Returns the number of locked resources.
    pub fn lock_count(&self) -> usize {
        self.state.lock().locks.len()
    }

    /// Returns the number of transactions holding locks.
    pub fn txn_count(&self) -> usize {
        self.state.lock().txn_locks.len()
    }

    /// Returns the locks held by a transaction.
    pub fn txn_locks(&self, xid: TxnId) -> Vec<LockTarget> {
        self.state
            .lock()
            .txn_locks
            .get(&xid)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for PageLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager for PageLockManager {
    fn commit(&self, xid: TxnId) {
        self.release_all(xid);
    }

    fn abort(&self, xid: TxnId) {
        self.release_all(xid);
    }

    fn read_lock_page(&self, xid: TxnId, page: PageId) -> TxnResult<()> {
        self.lock(xid, LockTarget::Page(page), LockMode::Shared)
    }

    fn write_lock_page(&self, xid: TxnId, page: PageId) -> TxnResult<()> {
        self.lock(xid, LockTarget::Page(page), LockMode::Exclusive)
    }

    fn read_lock_record(&self, xid: TxnId, rid: RecordId) -> TxnResult<()> {
        self.read_lock_page(xid, rid.page)
    }

    fn write_lock_record(&self, xid: TxnId, rid: RecordId) -> TxnResult<()> {
        self.write_lock_page(xid, rid.page)
    }
}

impl fmt::Debug for PageLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageLockManager")
            .field("lock_count", &self.lock_count())
            .field("txn_count", &self.txn_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn page(id: u64) -> PageId {
        PageId::new(id)
    }

    fn quick() -> PageLockManager {
        PageLockManager::with_config(LockManagerConfig {
            lock_timeout: Duration::from_millis(200),
            deadlock_detection: true,
        })
    }

    #[test]
    fn test_lock_mode_compatibility() {
        use LockMode::*;
        assert!(Shared.is_compatible_with(&Shared));
        assert!(!Shared.is_compatible_with(&Exclusive));
        assert!(!Exclusive.is_compatible_with(&Shared));
        assert!(!Exclusive.is_compatible_with(&Exclusive));
        assert!(Exclusive.covers(Shared));
        assert!(!Shared.covers(Exclusive));
    }

    #[test]
    fn test_shared_locks_concurrent() {
        let lm = quick();
        lm.read_lock_page(TxnId::new(1), page(3)).unwrap();
        lm.read_lock_page(TxnId::new(2), page(3)).unwrap();
        assert_eq!(lm.lock_count(), 1);
        assert_eq!(lm.txn_count(), 2);
    }

    #[test]
    fn test_lock_upgrade() {
        let lm = quick();
        let txn1 = TxnId::new(1);
        lm.read_lock_page(txn1, page(3)).unwrap();
        lm.write_lock_page(txn1, page(3)).unwrap();
        assert_eq!(lm.stats().upgrades.load(AtomicOrdering::Relaxed), 1);

        // Already covered.
        lm.read_lock_page(txn1, page(3)).unwrap();
        assert_eq!(lm.stats().acquisitions.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_exclusive_blocks_until_release() {
        let lm = Arc::new(PageLockManager::new());
        let txn1 = TxnId::new(1);
        let txn2 = TxnId::new(2);
        lm.write_lock_page(txn1, page(7)).unwrap();

        let waiter = {
            let lm = Arc::clone(&lm);
            thread::spawn(move || lm.read_lock_page(txn2, page(7)))
        };
        thread::sleep(Duration::from_millis(50));
        lm.commit(txn1);

        waiter.join().unwrap().unwrap();
        assert_eq!(lm.txn_locks(txn2), vec![LockTarget::Page(page(7))]);
    }

    #[test]
    fn test_timeout_is_deadlock() {
        let lm = quick();
        lm.write_lock_page(TxnId::new(1), page(1)).unwrap();
        let err = lm.write_lock_page(TxnId::new(2), page(1)).unwrap_err();
        assert!(err.is_deadlock());
        assert_eq!(lm.stats().timeouts.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_deadlock_cycle_detected() {
        let lm = Arc::new(PageLockManager::with_config(LockManagerConfig {
            lock_timeout: Duration::from_secs(5),
            deadlock_detection: true,
        }));
        let txn1 = TxnId::new(1);
        let txn2 = TxnId::new(2);
        lm.write_lock_page(txn1, page(1)).unwrap();
        lm.write_lock_page(txn2, page(2)).unwrap();

        let first = {
            let lm = Arc::clone(&lm);
            thread::spawn(move || lm.write_lock_page(txn1, page(2)))
        };
        thread::sleep(Duration::from_millis(50));

        let err = lm.write_lock_page(txn2, page(1)).unwrap_err();
        assert!(matches!(err, TxnError::Deadlock { xid } if xid == txn2));
        lm.abort(txn2);

        first.join().unwrap().unwrap();
        assert_eq!(lm.stats().deadlocks.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_release_all() {
        let lm = quick();
        let txn1 = TxnId::new(1);
        lm.read_lock_page(txn1, page(1)).unwrap();
        lm.write_lock_page(txn1, page(2)).unwrap();
        lm.write_lock_record(txn1, RecordId::new(page(3), 4, 8)).unwrap();

        assert_eq!(lm.txn_locks(txn1).len(), 3);
        assert_eq!(lm.release_all(txn1), 3);
        assert_eq!(lm.lock_count(), 0);
        assert_eq!(lm.stats().releases.load(AtomicOrdering::Relaxed), 3);
    }

    #[test]
    fn test_no_lock_manager_grants_everything() {
        let lm = NoLockManager;
        lm.write_lock_page(TxnId::new(1), page(1)).unwrap();
        lm.write_lock_page(TxnId::new(2), page(1)).unwrap();
    }
}
