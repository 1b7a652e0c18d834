//! Property checks: undo, redo, the write-ahead rule, slot allocation and
//! the region chain, each exercised with many operations.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use stasis_common::config::StasisConfig;
use stasis_common::constants::STORAGE_MANAGER_NAIVE_PAGE_ALLOC;
use stasis_common::types::{PageId, RecordId};
use stasis_storage::file::PageFile;
use stasis_storage::page::LSN_SIZE;
use stasis_storage::PAGE_SIZE;
use stasis_test::{init_tracing, CrashableStore, IoTrace, TracedLog, TracedPageFile};
use stasis_txn::TransactionManager;
use stasis_wal::LogHandle;

fn open() -> TransactionManager {
    init_tracing();
    TransactionManager::open(StasisConfig::for_testing()).expect("Failed to open engine")
}

fn value_for(rng: &mut StdRng, size: usize) -> Vec<u8> {
    (0..size).map(|_| rng.gen()).collect()
}

/// Every record an aborted transaction wrote reads back as it was before.
#[test]
fn test_abort_restores_every_record() {
    let tm = open();
    let mut rng = StdRng::seed_from_u64(7);

    let xid = tm.begin().expect("Failed to begin");
    let mut before = HashMap::new();
    for _ in 0..50 {
        let size = rng.gen_range(1..200);
        let rid = tm.alloc(xid, size).expect("Failed to allocate record");
        let value = value_for(&mut rng, size);
        tm.set(xid, rid, &value).expect("Failed to set");
        before.insert(rid, value);
    }
    tm.commit(xid).expect("Failed to commit");

    let rids: Vec<RecordId> = before.keys().copied().collect();
    let xid = tm.begin().expect("Failed to begin");
    for _ in 0..300 {
        let rid = rids[rng.gen_range(0..rids.len())];
        let value = value_for(&mut rng, rid.size as usize);
        tm.set(xid, rid, &value).expect("Failed to set");
    }
    let extra = tm.alloc(xid, 32).expect("Failed to allocate record");
    for rid in rids.iter().take(10) {
        tm.dealloc(xid, *rid).expect("Failed to free record");
    }
    tm.abort(xid).expect("Failed to abort");

    let xid = tm.begin().expect("Failed to begin");
    for (rid, value) in &before {
        assert_eq!(&tm.read(xid, *rid).expect("Failed to read"), value, "record {rid} changed");
    }
    assert_eq!(tm.record_size(xid, extra).expect("Failed to read size"), None);
    tm.commit(xid).expect("Failed to commit");
}

/// Running recovery a second time over its own result changes nothing.
#[test]
fn test_redo_is_idempotent() {
    let store = CrashableStore::new();
    let tm = store.open().expect("Failed to open engine");
    let mut rng = StdRng::seed_from_u64(11);

    let xid = tm.begin().expect("Failed to begin");
    let rids: Vec<RecordId> = (0..40)
        .map(|_| tm.alloc(xid, 16).expect("Failed to allocate record"))
        .collect();
    for rid in &rids {
        tm.set(xid, *rid, &value_for(&mut rng, 16)).expect("Failed to set");
    }
    tm.commit(xid).expect("Failed to commit");

    // Some pages reach the file, later updates only reach the log.
    tm.buffer_pool().flush_all().expect("Failed to flush");
    let xid = tm.begin().expect("Failed to begin");
    for rid in rids.iter().step_by(3) {
        tm.set(xid, *rid, &value_for(&mut rng, 16)).expect("Failed to set");
    }
    tm.commit(xid).expect("Failed to commit");
    let loser = tm.begin().expect("Failed to begin");
    for rid in rids.iter().step_by(5) {
        tm.set(loser, *rid, &value_for(&mut rng, 16)).expect("Failed to set");
    }
    tm.log().force_all().expect("Failed to force log");

    let pages: Vec<PageId> = {
        let mut pages: Vec<PageId> = rids.iter().map(|rid| rid.page).collect();
        pages.dedup();
        pages
    };
    let snapshot = |tm: &TransactionManager| -> Vec<Vec<u8>> {
        let xid = tm.begin().expect("Failed to begin");
        let images = pages
            .iter()
            .map(|page| tm.page_get(xid, *page).expect("Failed to read page"))
            .collect();
        tm.commit(xid).expect("Failed to commit");
        images
    };

    let tm = store.restart(tm).expect("Failed to recover");
    let first = snapshot(&tm);
    let tm = store.restart(tm).expect("Failed to recover again");
    let second = snapshot(&tm);
    assert_eq!(first, second);
    assert_eq!(first[0].len(), PAGE_SIZE);
}

/// A dirty page is never written before the log covers its LSN.
#[test]
fn test_page_writes_follow_log_forces() {
    init_tracing();
    let trace = IoTrace::new();
    let pages: Arc<dyn PageFile> = Arc::new(TracedPageFile::new(trace.clone()));
    let log: Arc<dyn LogHandle> = Arc::new(TracedLog::new(trace.clone()));
    // A tiny pool forces evictions of dirty pages.
    let config = StasisConfig::for_testing().with_buffer_frames(8);
    let tm = TransactionManager::open_with(config, pages, log).expect("Failed to open engine");
    let mut rng = StdRng::seed_from_u64(3);

    let xid = tm.begin().expect("Failed to begin");
    let first = tm.page_alloc_many(xid, 40).expect("Failed to allocate pages");
    for i in 0..40 {
        tm.initialize_fixed_page(xid, first.offset_by(i), 8)
            .expect("Failed to initialize page");
    }
    for _ in 0..400 {
        let page = first.offset_by(rng.gen_range(0..40));
        let rid = RecordId::new(page, rng.gen_range(0..100), 8);
        tm.set(xid, rid, &rng.gen::<u64>().to_le_bytes()).expect("Failed to set");
    }
    tm.commit(xid).expect("Failed to commit");
    tm.shutdown().expect("Failed to shut down");

    assert!(trace.writes() > 40, "the workload should evict pages");
    assert_eq!(trace.wal_violations(), Vec::new());
}

/// Slot contents survive the compaction a later allocation triggers.
#[test]
fn test_slot_round_trip_across_compaction() {
    let tm = open();
    let mut rng = StdRng::seed_from_u64(5);

    let xid = tm.begin().expect("Failed to begin");
    let page = tm.page_alloc(xid).expect("Failed to allocate page");
    tm.initialize_slotted_page(xid, page).expect("Failed to initialize page");
    let mut records = Vec::new();
    for _ in 0..30 {
        let rid = tm.alloc_from_page(xid, page, 100).expect("Failed to allocate record");
        assert_eq!(tm.read(xid, rid).expect("Failed to read").len(), 100);
        let value = value_for(&mut rng, 100);
        tm.set(xid, rid, &value).expect("Failed to set");
        records.push((rid, value));
    }
    tm.commit(xid).expect("Failed to commit");

    let xid = tm.begin().expect("Failed to begin");
    let (freed, kept): (Vec<_>, Vec<_>) =
        records.into_iter().enumerate().partition(|(i, _)| i % 2 == 0);
    for (_, (rid, _)) in &freed {
        tm.dealloc(xid, *rid).expect("Failed to free record");
    }
    tm.commit(xid).expect("Failed to commit");

    // Ten 150-byte records only fit once the holes are squeezed out.
    let xid = tm.begin().expect("Failed to begin");
    let mut added = Vec::new();
    for _ in 0..10 {
        let rid = tm.alloc_from_page(xid, page, 150).expect("Failed to allocate record");
        let value = value_for(&mut rng, 150);
        tm.set(xid, rid, &value).expect("Failed to set");
        added.push((rid, value));
    }
    tm.commit(xid).expect("Failed to commit");

    let xid = tm.begin().expect("Failed to begin");
    for (rid, value) in kept.iter().map(|(_, record)| record).chain(added.iter()) {
        assert_eq!(&tm.read(xid, *rid).expect("Failed to read"), value, "record {rid} changed");
    }
    tm.commit(xid).expect("Failed to commit");
}

/// Random region traffic leaves a consistent chain with no overlaps.
#[test]
fn test_region_chain_stays_consistent() {
    let tm = open();
    let mut rng = StdRng::seed_from_u64(13);
    let mut live: Vec<(PageId, u64)> = Vec::new();

    for _ in 0..20 {
        let xid = tm.begin().expect("Failed to begin");
        let mut mine = Vec::new();
        let mut freed = Vec::new();
        for _ in 0..5 {
            if !live.is_empty() && rng.gen_bool(0.4) {
                let region = live.swap_remove(rng.gen_range(0..live.len()));
                tm.region_dealloc(xid, region.0).expect("Failed to free region");
                freed.push(region);
            } else {
                let count = rng.gen_range(1..20);
                let first = tm
                    .region_alloc(xid, count, STORAGE_MANAGER_NAIVE_PAGE_ALLOC)
                    .expect("Failed to allocate region");
                mine.push((first, count));
            }
        }
        let committed = !rng.gen_bool(0.25);
        if committed {
            tm.commit(xid).expect("Failed to commit");
        } else {
            tm.abort(xid).expect("Failed to abort");
        }
        // A rolled back free only rezones pages nobody reused, so take the
        // live set from the chain itself.
        live = zoned_regions(&tm);
        for region in mine.iter().filter(|region| !freed.contains(region)) {
            assert_eq!(live.contains(region), committed, "region at {}", region.0);
        }

        let report = tm.fsck_regions().expect("Region chain is inconsistent");
        assert_eq!(report.zoned, live.len());
        assert_eq!(report.zoned_pages, live.iter().map(|(_, count)| count).sum::<u64>());

        let mut sorted = live.clone();
        sorted.sort();
        for pair in sorted.windows(2) {
            let (a, a_len) = pair[0];
            let (b, _) = pair[1];
            assert!(a.offset_by(a_len) < b, "regions at {a} and {b} overlap");
        }
    }
}

/// Regions the chain reports as handed out.
fn zoned_regions(tm: &TransactionManager) -> Vec<(PageId, u64)> {
    let mut regions = Vec::new();
    let mut after = None;
    while let Some((first, tag)) = tm
        .region_next_boundary_tag(after, STORAGE_MANAGER_NAIVE_PAGE_ALLOC)
        .expect("Failed to walk regions")
    {
        regions.push((first, tag.size));
        after = Some(first);
    }
    regions
}

/// Page writes through `page_set` cover everything but the LSN.
#[test]
fn test_page_set_keeps_lsn_out_of_image() {
    let tm = open();
    let xid = tm.begin().expect("Failed to begin");
    let page = tm.page_alloc(xid).expect("Failed to allocate page");
    let image = vec![0xab; PAGE_SIZE];
    let lsn = tm.page_set(xid, page, &image).expect("Failed to write page");
    let stored = tm.page_get(xid, page).expect("Failed to read page");
    assert_eq!(stored[..PAGE_SIZE - LSN_SIZE], image[..PAGE_SIZE - LSN_SIZE]);
    assert_eq!(tm.buffer_pool().load_page(page).expect("Failed to load page").lsn(), lsn);
    tm.commit(xid).expect("Failed to commit");
}
