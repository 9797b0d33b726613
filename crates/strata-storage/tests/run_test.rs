//! Sorted-run integration tests.
//!
//! Exercises a whole run end to end:
//! - Bulk build over many leaf pages and a multi-level index
//! - Point lookups, full and seeded scans
//! - Throttled iteration with a merge manager
//! - Region accounting through force and dealloc
//! - Reopening a run from a page file on disk

use bytes::Bytes;
use parking_lot::Mutex;
use proptest::prelude::*;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::tempdir;

use strata_common::{RunConfig, StorageConfig, StrataError, Xid};
use strata_storage::{
    DataTuple, DiskTreeComponent, FilePageStore, FlushSignal, IterProgress, MemPageStore,
    MergeManager, NoopStats, Origin, PageStore, RunStats, ThrottleHook,
};

const XID: Xid = Xid(1);
const KEY_COUNT: u32 = 1000;

// =============================================================================
// Helpers
// =============================================================================

/// Small leaf pages and a small fanout, so 1000 keys span many pages and at
/// least two index levels.
fn small_run_config() -> RunConfig {
    RunConfig {
        internal_region_pages: 16,
        datapage_region_pages: 64,
        datapage_size: 128,
        index_fanout: 16,
        bloom_filter_size: 0,
        bloom_fp_rate: 0.01,
    }
}

fn key(i: u32) -> [u8; 4] {
    i.to_be_bytes()
}

fn tuple(i: u32) -> DataTuple {
    DataTuple::new(key(i).to_vec(), i.to_string().into_bytes())
}

fn key_of(t: &DataTuple) -> u32 {
    u32::from_be_bytes(<[u8; 4]>::try_from(t.key().as_ref()).unwrap())
}

/// Builds and finalizes a run holding keys 1..=KEY_COUNT.
fn build_run(store: Arc<dyn PageStore>, config: &RunConfig) -> DiskTreeComponent {
    let mut run = DiskTreeComponent::create(store, XID, config, Arc::new(NoopStats)).unwrap();
    for i in 1..=KEY_COUNT {
        run.insert_tuple(XID, &tuple(i)).unwrap();
    }
    run.writes_done(XID).unwrap();
    run
}

fn scan_keys(run: &DiskTreeComponent, from: Option<&[u8]>) -> Vec<u32> {
    run.open_iterator_from(XID, from)
        .unwrap()
        .map(|t| key_of(&t.unwrap()))
        .collect()
}

// =============================================================================
// Build, Lookup and Scan
// =============================================================================

/// Keys 1..=1000 as big-endian u32 with their decimal string as value.
#[test]
fn test_thousand_keys_scenario() {
    println!("\n=== Thousand Key Run ===");

    let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new());
    let run = build_run(store, &small_run_config());

    let summary = run.internal_nodes().tree_summary(XID).unwrap();
    let datapages = run.internal_nodes().datapage_allocator().pages_allocated();
    println!("  Depth: {}", summary.depth);
    println!("  Nodes per level: {:?}", summary.nodes_per_level);
    println!("  Data pages: {}", datapages);
    assert!(datapages >= 3);
    assert!(summary.depth >= 2);
    assert_eq!(summary.leaf_entries as u64, datapages);

    let all: Vec<DataTuple> = run
        .open_iterator(XID, None)
        .unwrap()
        .map(|t| t.unwrap())
        .collect();
    assert_eq!(all.len(), KEY_COUNT as usize);
    for (i, t) in all.iter().enumerate() {
        assert_eq!(t, &tuple(i as u32 + 1));
    }

    let found = run.find_tuple(XID, &key(500)).unwrap().unwrap();
    assert_eq!(found.value().unwrap().as_ref(), b"500");
    assert_eq!(run.find_tuple(XID, &key(1001)).unwrap(), None);
    assert_eq!(run.find_tuple(XID, &key(0)).unwrap(), None);

    let seeded = scan_keys(&run, Some(&key(500)[..]));
    assert_eq!(seeded.len(), 501);
    assert_eq!(seeded.first(), Some(&500));
    assert_eq!(seeded.last(), Some(&1000));
}

#[test]
fn test_seeded_scan_from_every_page_boundary() {
    let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new());
    let run = build_run(store, &small_run_config());

    let boundaries: Vec<u32> = run
        .internal_nodes()
        .iter(XID)
        .unwrap()
        .map(|e| u32::from_be_bytes(<[u8; 4]>::try_from(e.unwrap().key.as_ref()).unwrap()))
        .collect();
    assert!(boundaries.len() >= 3);

    for &b in &boundaries {
        for start in [b.saturating_sub(1).max(1), b, b + 1] {
            let got = scan_keys(&run, Some(&key(start)[..]));
            let expected: Vec<u32> = (start..=KEY_COUNT).collect();
            assert_eq!(got, expected, "seek from {}", start);
        }
    }
}

#[test]
fn test_shuffled_point_lookups() {
    let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new());
    let run = build_run(store, &small_run_config());

    let mut lookups: Vec<u32> = (1..=KEY_COUNT).collect();
    lookups.shuffle(&mut rand::thread_rng());
    for i in lookups {
        assert_eq!(run.find_tuple(XID, &key(i)).unwrap(), Some(tuple(i)));
    }

    for i in [KEY_COUNT + 1, KEY_COUNT + 500, u32::MAX] {
        assert_eq!(run.find_tuple(XID, &key(i)).unwrap(), None);
    }
}

#[test]
fn test_find_page_matches_registered_page() {
    let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new());
    let run = build_run(store, &small_run_config());
    let tree = run.internal_nodes();

    for entry in tree.iter(XID).unwrap() {
        let entry = entry.unwrap();
        assert_eq!(tree.find_page(XID, &entry.key).unwrap(), Some(entry.page));
        let rid = tree.lookup(XID, &entry.key).unwrap().unwrap();
        assert_eq!(tree.lookup_leaf_page_from_rid(XID, rid).unwrap(), entry.page);
    }

    assert_eq!(
        tree.find_first_leaf(XID).unwrap(),
        tree.find_page(XID, &key(1)).unwrap()
    );
    assert_eq!(
        tree.find_last_leaf(XID).unwrap(),
        tree.find_page(XID, &key(KEY_COUNT)).unwrap()
    );
}

#[test]
fn test_duplicate_keys_across_pages() {
    let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new());
    let mut run =
        DiskTreeComponent::create(store, XID, &small_run_config(), Arc::new(NoopStats)).unwrap();

    run.insert_tuple(XID, &DataTuple::new("a", "first")).unwrap();
    for i in 0..40 {
        run.insert_tuple(XID, &DataTuple::new("dup", format!("{:02}", i)))
            .unwrap();
    }
    run.insert_tuple(XID, &DataTuple::tombstone("zz")).unwrap();
    run.writes_done(XID).unwrap();
    assert!(run.internal_nodes().datapage_allocator().pages_allocated() >= 3);

    let all: Vec<DataTuple> = run
        .open_iterator(XID, None)
        .unwrap()
        .map(|t| t.unwrap())
        .collect();
    assert_eq!(all.len(), 42);
    assert!(all.last().unwrap().is_tombstone());

    let found = run.find_tuple(XID, b"dup").unwrap().unwrap();
    assert_eq!(found.key().as_ref(), b"dup");

    // Every duplicate is returned by a scan seeded at the duplicated key.
    let seeded: Vec<DataTuple> = run
        .open_iterator_from(XID, Some(&b"dup"[..]))
        .unwrap()
        .map(|t| t.unwrap())
        .collect();
    assert_eq!(seeded.len(), 41);
    for (i, t) in seeded.iter().take(40).enumerate() {
        assert_eq!(t.value().unwrap(), &Bytes::from(format!("{:02}", i)));
    }
}

// =============================================================================
// Iterator Lifecycle and Throttling
// =============================================================================

#[test]
fn test_close_is_idempotent_at_every_stage() {
    let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new());
    let mut run = build_run(store, &small_run_config());

    let mut before = run.open_iterator(XID, None).unwrap();
    before.close();
    before.close();
    assert!(matches!(before.next_tuple(), Err(StrataError::IteratorClosed)));

    let mut midway = run.open_iterator(XID, None).unwrap();
    for _ in 0..300 {
        midway.next_tuple().unwrap().unwrap();
    }
    midway.close();
    midway.close();

    let mut after = run.open_iterator(XID, None).unwrap();
    while after.next_tuple().unwrap().is_some() {}
    after.close();
    after.close();

    assert_eq!(run.open_iterator_count(), 3);
    drop((before, midway, after));
    assert_eq!(run.open_iterator_count(), 0);
    run.dealloc(XID).unwrap();
}

/// Records every report and raises the flush signal after two pages.
struct PacingManager {
    signal: FlushSignal,
    tuples: Mutex<u64>,
    bytes: Mutex<u64>,
    boundaries: Mutex<Vec<(IterProgress, f64, bool)>>,
}

impl MergeManager for PacingManager {
    fn tuple_read(&self, bytes: usize) {
        *self.tuples.lock() += 1;
        *self.bytes.lock() += bytes as u64;
    }

    fn page_boundary(&self, progress: &IterProgress, target_progress_delta: f64, flushing: bool) {
        self.boundaries
            .lock()
            .push((*progress, target_progress_delta, flushing));
        if progress.pages_read == 2 {
            self.signal.raise();
        }
    }
}

#[test]
fn test_throttled_iteration_reports_progress() {
    println!("\n=== Throttled Iteration ===");

    let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new());
    let run = build_run(store, &small_run_config());
    let datapages = run.internal_nodes().datapage_allocator().pages_allocated();

    let signal = FlushSignal::new();
    let manager = Arc::new(PacingManager {
        signal: signal.clone(),
        tuples: Mutex::new(0),
        bytes: Mutex::new(0),
        boundaries: Mutex::new(Vec::new()),
    });
    let hook = ThrottleHook::new(manager.clone(), signal, 0.1);

    let mut iter = run.open_iterator(XID, Some(hook)).unwrap();
    let mut count = 0;
    while iter.next_tuple().unwrap().is_some() {
        count += 1;
    }
    let progress = iter.progress();
    println!("  Tuples: {}, pages: {}", progress.tuples_read, progress.pages_read);

    assert_eq!(count, KEY_COUNT);
    assert_eq!(*manager.tuples.lock(), KEY_COUNT as u64);
    assert_eq!(*manager.bytes.lock(), progress.bytes_read);
    assert_eq!(progress.pages_read, datapages);

    let boundaries = manager.boundaries.lock();
    assert_eq!(boundaries.len() as u64, datapages);
    assert!(!boundaries[0].2);
    assert!(!boundaries[1].2);
    assert!(boundaries[2..].iter().all(|b| b.2));
    assert!(boundaries.iter().all(|b| b.1 == 0.1));
    assert!(boundaries.windows(2).all(|w| w[0].0.tuples_read < w[1].0.tuples_read));
    assert_eq!(boundaries.last().unwrap().0.tuples_read, KEY_COUNT as u64);
}

// =============================================================================
// Regions, Stats and Bloom Filter
// =============================================================================

#[test]
fn test_region_accounting_force_and_dealloc() {
    let store = Arc::new(MemPageStore::new());
    let mut run = build_run(store.clone(), &small_run_config());

    let listing = run.list_regions();
    assert_eq!(listing.internal_node_region_length, 16);
    assert_eq!(listing.datapage_region_length, 64);
    assert!(listing.datapage_regions.len() >= 2);
    assert_eq!(
        store.live_regions().len(),
        listing.internal_node_regions.len() + listing.datapage_regions.len()
    );

    run.force(XID).unwrap();
    assert_eq!(run.list_regions(), listing);
    assert!(store.force_count() >= 1);

    run.dealloc(XID).unwrap();
    assert!(run.list_regions().is_empty());
    assert!(store.live_regions().is_empty());
    assert!(matches!(run.force(XID), Err(StrataError::AlreadyDeallocated)));
}

/// A store that runs out of pages mid-build must not yield a run missing
/// tuples that were already accepted, even once space is freed again.
#[test]
fn test_out_of_space_build_refuses_further_writes() {
    let store = Arc::new(MemPageStore::with_capacity(39));
    let spare = store.alloc_region(XID, 4).unwrap();

    let config = RunConfig {
        internal_region_pages: 2,
        datapage_region_pages: 32,
        datapage_size: 64,
        index_fanout: 2,
        ..small_run_config()
    };
    let mut run =
        DiskTreeComponent::create(store.clone(), XID, &config, Arc::new(NoopStats)).unwrap();

    let mut accepted = 0;
    let err = loop {
        match run.insert_tuple(XID, &tuple(accepted)) {
            Ok(()) => accepted += 1,
            Err(e) => break e,
        }
        assert!(accepted < 100, "store never ran out of pages");
    };
    println!("insert {} failed: {}", accepted, err);
    assert!(matches!(err, StrataError::RegionExhausted(_)));

    store.free_region(XID, spare).unwrap();
    assert!(matches!(
        run.insert_tuple(XID, &tuple(accepted)),
        Err(StrataError::BuildFailed)
    ));
    assert!(matches!(run.writes_done(XID), Err(StrataError::BuildFailed)));
    assert!(run.is_failed());

    run.dealloc(XID).unwrap();
    assert!(store.live_regions().is_empty());
}

#[test]
fn test_stats_sink_totals() {
    let stats = Arc::new(RunStats::new());
    let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new());
    let mut run =
        DiskTreeComponent::create(store, XID, &small_run_config(), stats.clone()).unwrap();
    for i in 1..=KEY_COUNT {
        run.insert_tuple(XID, &tuple(i)).unwrap();
    }
    assert_eq!(stats.snapshot().writes_done, 0);
    run.writes_done(XID).unwrap();

    let snap = stats.snapshot();
    assert_eq!(snap.tuples, KEY_COUNT as u64);
    assert_eq!(snap.writes_done, 1);
    assert_eq!(snap.bytes, snap.datapage_bytes);
    assert_eq!(
        snap.datapages,
        run.internal_nodes().datapage_allocator().pages_allocated()
    );
}

#[test]
fn test_bloom_filter_soundness_and_rate() {
    println!("\n=== Bloom Filter ===");

    let config = RunConfig {
        bloom_filter_size: KEY_COUNT as u64,
        bloom_fp_rate: 0.01,
        ..small_run_config()
    };
    let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new());
    let run = build_run(store, &config);
    let bloom = run.bloom_filter().unwrap();

    for i in 1..=KEY_COUNT {
        assert!(bloom.might_contain(&key(i)));
        assert!(run.find_tuple(XID, &key(i)).unwrap().is_some());
    }

    let trials = 20_000u32;
    let false_positives = (KEY_COUNT + 1..=KEY_COUNT + trials)
        .filter(|&i| bloom.might_contain(&key(i)))
        .count();
    let rate = false_positives as f64 / trials as f64;
    println!("  False positive rate: {:.4}", rate);
    assert!(rate < 0.03, "false positive rate {}", rate);

    for i in KEY_COUNT + 1..=KEY_COUNT + 100 {
        assert_eq!(run.find_tuple(XID, &key(i)).unwrap(), None);
    }
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_reopen_from_page_file() {
    println!("\n=== Reopen From Disk ===");

    let dir = tempdir().unwrap();
    let storage = StorageConfig {
        data_dir: dir.path().to_path_buf(),
        file_name: "runs.pages".to_string(),
        fsync_enabled: false,
    };

    let (locators, listing) = {
        let store: Arc<dyn PageStore> = Arc::new(FilePageStore::open(storage.clone()).unwrap());
        let run = build_run(store, &small_run_config());
        run.force(XID).unwrap();
        (run.locators(), run.list_regions())
    };

    let store: Arc<dyn PageStore> = Arc::new(FilePageStore::open(storage).unwrap());
    let mut run = DiskTreeComponent::open(store.clone(), Xid(2), locators, Arc::new(NoopStats))
        .unwrap();
    assert_eq!(run.origin(), Origin::Reopened);
    assert_eq!(run.list_regions(), listing);
    run.print_tree(Xid(2)).unwrap();

    let found = run.find_tuple(Xid(2), &key(777)).unwrap().unwrap();
    assert_eq!(found.value().unwrap().as_ref(), b"777");
    assert_eq!(run.open_iterator(Xid(2), None).unwrap().count(), KEY_COUNT as usize);
    assert!(matches!(
        run.insert_tuple(Xid(2), &tuple(KEY_COUNT + 1)),
        Err(StrataError::WritesDone)
    ));

    run.dealloc(Xid(2)).unwrap();
    assert!(store.live_regions().is_empty());
}

// =============================================================================
// Property Tests
// =============================================================================

fn arb_run() -> impl Strategy<Value = BTreeMap<Vec<u8>, Vec<u8>>> {
    prop::collection::btree_map(
        prop::collection::vec(any::<u8>(), 1..16),
        prop::collection::vec(any::<u8>(), 0..32),
        0..300,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_build_scan_lookup(entries in arb_run(), needle in prop::collection::vec(any::<u8>(), 1..16)) {
        let config = RunConfig {
            internal_region_pages: 8,
            datapage_region_pages: 16,
            datapage_size: 128,
            index_fanout: 3,
            bloom_filter_size: 0,
            bloom_fp_rate: 0.01,
        };
        let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new());
        let mut run = DiskTreeComponent::create(store, XID, &config, Arc::new(NoopStats)).unwrap();
        for (k, v) in &entries {
            run.insert_tuple(XID, &DataTuple::new(k.clone(), v.clone())).unwrap();
        }
        run.writes_done(XID).unwrap();

        let scanned: Vec<(Vec<u8>, Vec<u8>)> = run
            .open_iterator(XID, None)
            .unwrap()
            .map(|t| {
                let t = t.unwrap();
                (t.key().to_vec(), t.value().unwrap().to_vec())
            })
            .collect();
        let expected: Vec<(Vec<u8>, Vec<u8>)> =
            entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        prop_assert_eq!(scanned, expected);

        for (k, v) in &entries {
            let found = run.find_tuple(XID, k).unwrap();
            prop_assert_eq!(found.map(|t| t.value().unwrap().to_vec()), Some(v.clone()));
        }
        let found = run.find_tuple(XID, &needle).unwrap();
        prop_assert_eq!(found.map(|t| t.value().unwrap().to_vec()), entries.get(&needle).cloned());

        let from: Vec<Vec<u8>> = run
            .open_iterator_from(XID, Some(needle.as_slice()))
            .unwrap()
            .map(|t| t.unwrap().key().to_vec())
            .collect();
        let expected: Vec<Vec<u8>> = entries.range(needle.clone()..).map(|(k, _)| k.clone()).collect();
        prop_assert_eq!(from, expected);
    }
}
