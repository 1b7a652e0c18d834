//! Deadlock detection using wait-for graph analysis.
//!
//! The page lock manager records an edge `waiter -> holder` for every
//! holder a blocked request waits behind, and asks the graph for a cycle
//! through the waiter before it goes to sleep:
//!
//! ```text
//! T1 waits for T2:  T1 -> T2
//! T2 waits for T1:  T2 -> T1 (cycle = deadlock!)
//! ```
//!
//! The requester that closes a cycle is the victim. It receives the
//! deadlock sentinel and is expected to abort, which releases its locks
//! and lets the rest of the cycle proceed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use stasis_common::types::TxnId;

/// Result of deadlock detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockInfo {
    /// The cycle of transactions involved, starting at the requester.
    pub cycle: Vec<TxnId>,
    /// The transaction that must abort.
    pub victim: TxnId,
}

/// Statistics about deadlock detection.
#[derive(Debug, Default)]
pub struct DeadlockStats {
    /// Number of detection checks performed.
    pub checks: AtomicU64,
    /// Number of deadlocks found.
    pub deadlocks_found: AtomicU64,
}

impl DeadlockStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }
}

/// The wait-for graph.
///
/// Not synchronized; it lives inside the lock manager's state mutex.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    /// Edges: waiter -> set of holders it's waiting for.
    edges: HashMap<TxnId, HashSet<TxnId>>,
    stats: DeadlockStats,
}

impl WaitForGraph {
    /// Creates a new empty wait-for graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a wait-for edge: waiter is waiting for holder.
    pub fn add_wait(&mut self, waiter: TxnId, holder: TxnId) {
        if waiter != holder {
            self.edges.entry(waiter).or_default().insert(holder);
        }
    }

    /// Clears all waits for a transaction.
    pub fn clear_waits(&mut self, waiter: TxnId) {
        self.edges.remove(&waiter);
    }

    /// Removes a transaction and every edge that points at it.
    pub fn remove_txn(&mut self, txn_id: TxnId) {
        self.edges.remove(&txn_id);
        for holders in self.edges.values_mut() {
            holders.remove(&txn_id);
        }
        self.edges.retain(|_, holders| !holders.is_empty());
    }

    /// Detects a cycle through `start_txn`.
    pub fn detect_deadlock(&self, start_txn: TxnId) -> Option<DeadlockInfo> {
        self.stats.checks.fetch_add(1, AtomicOrdering::Relaxed);

        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if !self.dfs_find_cycle(start_txn, start_txn, &mut visited, &mut path) {
            return None;
        }

        self.stats
            .deadlocks_found
            .fetch_add(1, AtomicOrdering::Relaxed);
        Some(DeadlockInfo {
            cycle: path,
            victim: start_txn,
        })
    }

    /// DFS for a path from `current` back to `target`.
    fn dfs_find_cycle(
        &self,
        current: TxnId,
        target: TxnId,
        visited: &mut HashSet<TxnId>,
        path: &mut Vec<TxnId>,
    ) -> bool {
        if !visited.insert(current) {
            return false;
        }
        path.push(current);

        if let Some(holders) = self.edges.get(&current) {
            for &holder in holders {
                if holder == target {
                    return true;
                }
                if self.dfs_find_cycle(holder, target, visited, path) {
                    return true;
                }
            }
        }

        path.pop();
        false
    }

    /// Returns statistics.
    pub fn stats(&self) -> &DeadlockStats {
        &self.stats
    }

    /// Returns the number of waiting transactions.
    pub fn waiter_count(&self) -> usize {
        self.edges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(id: u64) -> TxnId {
        TxnId::new(id)
    }

    #[test]
    fn test_no_deadlock() {
        let mut wfg = WaitForGraph::new();
        wfg.add_wait(txn(1), txn(2));
        wfg.add_wait(txn(2), txn(3));
        assert!(wfg.detect_deadlock(txn(1)).is_none());
    }

    #[test]
    fn test_simple_deadlock() {
        let mut wfg = WaitForGraph::new();
        wfg.add_wait(txn(1), txn(2));
        wfg.add_wait(txn(2), txn(1));

        let info = wfg.detect_deadlock(txn(2)).unwrap();
        assert_eq!(info.victim, txn(2));
        assert_eq!(info.cycle, vec![txn(2), txn(1)]);
    }

    #[test]
    fn test_three_way_deadlock() {
        let mut wfg = WaitForGraph::new();
        wfg.add_wait(txn(1), txn(2));
        wfg.add_wait(txn(2), txn(3));
        wfg.add_wait(txn(3), txn(1));

        let info = wfg.detect_deadlock(txn(1)).unwrap();
        assert_eq!(info.cycle.len(), 3);
        assert_eq!(info.cycle[0], txn(1));
    }

    #[test]
    fn test_cycle_elsewhere_is_not_ours() {
        let mut wfg = WaitForGraph::new();
        wfg.add_wait(txn(2), txn(3));
        wfg.add_wait(txn(3), txn(2));
        wfg.add_wait(txn(1), txn(2));
        assert!(wfg.detect_deadlock(txn(1)).is_none());
    }

    #[test]
    fn test_remove_txn_breaks_cycle() {
        let mut wfg = WaitForGraph::new();
        wfg.add_wait(txn(1), txn(2));
        wfg.add_wait(txn(2), txn(1));

        wfg.remove_txn(txn(2));
        assert!(wfg.detect_deadlock(txn(1)).is_none());
        assert_eq!(wfg.waiter_count(), 0);
    }

    #[test]
    fn test_stats() {
        let mut wfg = WaitForGraph::new();
        wfg.add_wait(txn(1), txn(2));
        wfg.add_wait(txn(2), txn(1));
        wfg.detect_deadlock(txn(1));
        wfg.detect_deadlock(txn(1));

        assert_eq!(wfg.stats().checks.load(AtomicOrdering::Relaxed), 2);
        assert_eq!(wfg.stats().deadlocks_found.load(AtomicOrdering::Relaxed), 2);
    }
}
