//! End-to-end scenarios for the storage engine.
//!
//! Each test drives the public transaction API the way an application
//! would: regions, records, array lists, crash recovery, and lock
//! contention.

use std::sync::Barrier;
use std::thread;

use stasis_common::config::StasisConfig;
use stasis_common::constants::STORAGE_MANAGER_TALLOC;
use stasis_common::types::{RecordId, TxnId};
use stasis_test::{init_tracing, CrashableStore};
use stasis_txn::{TransactionManager, TxnError};

fn open() -> TransactionManager {
    init_tracing();
    TransactionManager::open(StasisConfig::for_testing()).expect("Failed to open engine")
}

fn read_i32(tm: &TransactionManager, rid: RecordId) -> i32 {
    let xid = tm.begin().expect("Failed to begin");
    let value = tm.read(xid, rid).expect("Failed to read");
    tm.commit(xid).expect("Failed to commit");
    i32::from_le_bytes(value.try_into().expect("Record is not 4 bytes"))
}

/// Freed regions are reused first fit instead of growing the file.
#[test]
fn test_region_reuse_is_first_fit() {
    let tm = open();
    let xid = tm.begin().expect("Failed to begin");

    let first = tm
        .region_alloc(xid, 100, STORAGE_MANAGER_TALLOC)
        .expect("Failed to allocate region");
    assert_eq!(tm.region_size(first).expect("Failed to read size"), 100);

    tm.region_dealloc(xid, first).expect("Failed to free region");
    let reused = tm
        .region_alloc(xid, 1, STORAGE_MANAGER_TALLOC)
        .expect("Failed to allocate region");
    assert_eq!(reused, first, "the freed region should be reused");
    assert_eq!(tm.region_size(reused).expect("Failed to read size"), 1);

    tm.commit(xid).expect("Failed to commit");

    let report = tm.fsck_regions().expect("Region chain is inconsistent");
    assert_eq!(report.zoned, 1);
    assert_eq!(report.zoned_pages, 1);
    // The freed pages merged back into the open-ended tail.
    assert_eq!(report.vacant_pages, 0);
}

/// An aborted overwrite leaves the committed value in place.
#[test]
fn test_abort_restores_committed_value() {
    let tm = open();

    let xid = tm.begin().expect("Failed to begin");
    let rid = tm.alloc(xid, 4).expect("Failed to allocate record");
    tm.set(xid, rid, &2i32.to_le_bytes()).expect("Failed to set");
    tm.commit(xid).expect("Failed to commit");

    let xid = tm.begin().expect("Failed to begin");
    tm.set(xid, rid, &3i32.to_le_bytes()).expect("Failed to set");
    assert_eq!(tm.read(xid, rid).expect("Failed to read"), 3i32.to_le_bytes());
    tm.abort(xid).expect("Failed to abort");

    assert_eq!(read_i32(&tm, rid), 2);
}

/// Ten thousand records written through an array list read back in order.
#[test]
fn test_array_list_round_trip() {
    const RECORDS: u64 = 10_000;
    let tm = open();

    let xid = tm.begin().expect("Failed to begin");
    let list = tm
        .array_list_alloc(xid, 4, 2, 8)
        .expect("Failed to allocate array list");
    tm.array_list_extend(xid, list, RECORDS)
        .expect("Failed to extend array list");
    for offset in 0..RECORDS {
        let rid = tm
            .array_list_dereference(xid, list, offset)
            .expect("Failed to dereference");
        tm.set(xid, rid, &(offset * 3 + 1).to_le_bytes())
            .expect("Failed to set");
    }
    tm.commit(xid).expect("Failed to commit");

    let xid = tm.begin().expect("Failed to begin");
    assert_eq!(tm.array_list_length(xid, list).expect("Failed to read length"), RECORDS);
    for offset in 0..RECORDS {
        let rid = tm
            .array_list_dereference(xid, list, offset)
            .expect("Failed to dereference");
        let value = tm.read(xid, rid).expect("Failed to read");
        assert_eq!(
            u64::from_le_bytes(value.try_into().expect("Record is not 8 bytes")),
            offset * 3 + 1,
            "wrong value at offset {offset}"
        );
    }
    tm.commit(xid).expect("Failed to commit");
}

/// After a crash, committed work is visible and uncommitted work is not.
#[test]
fn test_crash_keeps_only_committed_work() {
    let store = CrashableStore::new();
    let tm = store.open().expect("Failed to open engine");

    let xid = tm.begin().expect("Failed to begin");
    let committed = tm.alloc(xid, 4).expect("Failed to allocate record");
    let pending = tm.alloc(xid, 4).expect("Failed to allocate record");
    tm.set(xid, committed, &0i32.to_le_bytes()).expect("Failed to set");
    tm.set(xid, pending, &0i32.to_le_bytes()).expect("Failed to set");
    tm.commit(xid).expect("Failed to commit");

    let xid = tm.begin().expect("Failed to begin");
    tm.set(xid, committed, &11i32.to_le_bytes()).expect("Failed to set");
    tm.commit(xid).expect("Failed to commit");

    let loser = tm.begin().expect("Failed to begin");
    tm.set(loser, pending, &22i32.to_le_bytes()).expect("Failed to set");
    // Push the uncommitted value to the page file so recovery has to undo it.
    tm.buffer_pool().flush_all().expect("Failed to flush");

    let tm = store.restart(tm).expect("Failed to recover");
    assert_eq!(read_i32(&tm, committed), 11);
    assert_eq!(read_i32(&tm, pending), 0);
    assert!(!tm.is_active(loser));
    tm.shutdown().expect("Failed to shut down");
}

/// Two upgrades of the same page lock deadlock; the victim aborts and the
/// survivor's write is the only one committed.
#[test]
fn test_page_lock_deadlock() {
    init_tracing();
    let config = StasisConfig::for_testing().with_page_locking(true);
    let tm = TransactionManager::open(config).expect("Failed to open engine");

    let setup = tm.begin().expect("Failed to begin");
    let rid = tm.alloc(setup, 4).expect("Failed to allocate record");
    tm.set(setup, rid, &0i32.to_le_bytes()).expect("Failed to set");
    tm.commit(setup).expect("Failed to commit");

    let barrier = Barrier::new(2);
    let outcomes: Vec<(i32, Result<TxnId, TxnError>)> = thread::scope(|scope| {
        let workers: Vec<_> = [1i32, 2]
            .into_iter()
            .map(|value| {
                let tm = &tm;
                let barrier = &barrier;
                scope.spawn(move || {
                    let xid = tm.begin().expect("Failed to begin");
                    tm.read(xid, rid).expect("Failed to read");
                    barrier.wait();
                    match tm.set(xid, rid, &value.to_le_bytes()) {
                        Ok(_) => {
                            tm.commit(xid).expect("Failed to commit");
                            (value, Ok(xid))
                        }
                        Err(err) => {
                            tm.abort(xid).expect("Failed to abort victim");
                            (value, Err(err))
                        }
                    }
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().expect("Worker panicked"))
            .collect()
    });

    let winners: Vec<i32> = outcomes
        .iter()
        .filter(|(_, outcome)| outcome.is_ok())
        .map(|(value, _)| *value)
        .collect();
    let victims: Vec<&TxnError> = outcomes
        .iter()
        .filter_map(|(_, outcome)| outcome.as_ref().err())
        .collect();

    assert_eq!(winners.len(), 1, "exactly one transaction should commit");
    assert_eq!(victims.len(), 1, "exactly one transaction should be the victim");
    assert!(victims[0].is_deadlock(), "victim failed with {}", victims[0]);
    assert_eq!(read_i32(&tm, rid), winners[0]);
    assert!(tm.stats().deadlocks.load(std::sync::atomic::Ordering::Relaxed) >= 1);
}
