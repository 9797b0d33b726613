//! Stats sink notified while a run is written.

use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::page::PageId;

/// Receives progress notifications from a component being built.
///
/// Shared between the component and the merge scheduler; implementations
/// must be cheap and must not block.
pub trait MergeStats: Send + Sync {
    /// A tuple of `bytes` encoded bytes was accepted.
    fn tuple_inserted(&self, bytes: usize);

    /// A leaf data page was finalized and registered in the index.
    fn datapage_finalized(&self, page: PageId, tuples: usize, bytes: usize);

    /// The component was finalized.
    fn writes_done(&self);
}

/// A stats sink that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStats;

impl MergeStats for NoopStats {
    fn tuple_inserted(&self, _bytes: usize) {}
    fn datapage_finalized(&self, _page: PageId, _tuples: usize, _bytes: usize) {}
    fn writes_done(&self) {}
}

/// Stats sink keeping running totals in atomic counters.
#[derive(Debug, Default)]
pub struct RunStats {
    tuples: AtomicU64,
    bytes: AtomicU64,
    datapages: AtomicU64,
    datapage_bytes: AtomicU64,
    writes_done: AtomicU64,
}

/// Point-in-time copy of [`RunStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunStatsSnapshot {
    /// Tuples accepted.
    pub tuples: u64,
    /// Encoded bytes of the accepted tuples.
    pub bytes: u64,
    /// Leaf data pages finalized.
    pub datapages: u64,
    /// Encoded tuple bytes stored in finalized pages.
    pub datapage_bytes: u64,
    /// Number of `writes_done` notifications.
    pub writes_done: u64,
}

impl RunStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads all counters.
    pub fn snapshot(&self) -> RunStatsSnapshot {
        RunStatsSnapshot {
            tuples: self.tuples.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            datapages: self.datapages.load(Ordering::Relaxed),
            datapage_bytes: self.datapage_bytes.load(Ordering::Relaxed),
            writes_done: self.writes_done.load(Ordering::Relaxed),
        }
    }
}

impl MergeStats for RunStats {
    fn tuple_inserted(&self, bytes: usize) {
        self.tuples.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn datapage_finalized(&self, _page: PageId, _tuples: usize, bytes: usize) {
        self.datapages.fetch_add(1, Ordering::Relaxed);
        self.datapage_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn writes_done(&self) {
        self.writes_done.fetch_add(1, Ordering::Relaxed);
    }
}
