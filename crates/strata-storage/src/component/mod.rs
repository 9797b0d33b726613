//! The on-disk sorted run.
//!
//! A [`DiskTreeComponent`] is written once, in key order, and then only read:
//!
//! ```text
//!   insert_tuple ──> open DataPage ──full──> finalize page
//!                                                 │
//!                                                 v
//!                                   InternalNodes::append_page(first_key)
//!
//!   writes_done ──> finalize last page, freeze tree
//!
//!   find_tuple ──> bloom ──> find_page ──> DataPage::find
//!   open_iterator ──> IndexIterator ──> DataPage scans
//! ```
//!
//! A component is either built fresh with [`DiskTreeComponent::create`] or
//! reopened from its [`RunLocators`] with [`DiskTreeComponent::open`]. The
//! bloom filter lives in memory only, so a reopened component always takes
//! the index path on lookups.

pub mod iterator;
pub mod stats;
pub mod throttle;

pub use iterator::ComponentIterator;
pub use stats::{MergeStats, NoopStats, RunStats, RunStatsSnapshot};
pub use throttle::{FlushSignal, IterProgress, MergeManager, ThrottleHook};

use crate::bloom::BloomFilter;
use crate::datapage::DataPage;
use crate::store::PageStore;
use crate::tree::{InternalNodes, MAX_KEY_SIZE};
use crate::tuple::DataTuple;
use bytes::Bytes;
use iterator::IteratorGuard;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use strata_common::page::PageId;
use strata_common::{RecordId, Result, RunConfig, StrataError, Xid};
use tracing::{debug, info, warn};

/// How a component handle came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Built by this handle with `create`.
    FreshBuild,
    /// Reconstructed from persisted locators with `open`.
    Reopened,
}

/// The three locators a finalized component is reopened from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLocators {
    /// Root node header of the index tree.
    pub root: RecordId,
    /// Persisted state of the index node region allocator.
    pub internal_node_state: RecordId,
    /// Persisted state of the data page region allocator.
    pub datapage_state: RecordId,
}

/// Pages a component holds, as the scheduler sees them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegionListing {
    /// Pages per extent of the index node region.
    pub internal_node_region_length: u64,
    /// First page of every index node extent.
    pub internal_node_regions: Vec<PageId>,
    /// Pages per extent of the data page region.
    pub datapage_region_length: u64,
    /// First page of every data page extent.
    pub datapage_regions: Vec<PageId>,
}

impl RegionListing {
    /// Returns true if the component holds no extents.
    pub fn is_empty(&self) -> bool {
        self.internal_node_regions.is_empty() && self.datapage_regions.is_empty()
    }

    /// Total pages reserved across both regions.
    pub fn total_pages(&self) -> u64 {
        self.internal_node_region_length * self.internal_node_regions.len() as u64
            + self.datapage_region_length * self.datapage_regions.len() as u64
    }
}

enum WriteState {
    Building {
        page: Option<DataPage>,
        last_key: Option<Bytes>,
    },
    /// A page write or index append failed part way; the run on disk no
    /// longer matches the tuples acknowledged so far.
    Failed,
    Finalized,
}

/// One sorted run: an index tree over leaf data pages plus an optional
/// bloom filter.
pub struct DiskTreeComponent {
    store: Arc<dyn PageStore>,
    tree: InternalNodes,
    state: WriteState,
    datapage_size: usize,
    stats: Arc<dyn MergeStats>,
    bloom: Option<BloomFilter>,
    origin: Origin,
    open_iterators: Arc<AtomicUsize>,
    deallocated: bool,
}

impl DiskTreeComponent {
    /// Reserves fresh regions and returns a component in write mode.
    pub fn create(
        store: Arc<dyn PageStore>,
        xid: Xid,
        config: &RunConfig,
        stats: Arc<dyn MergeStats>,
    ) -> Result<Self> {
        config.validate()?;

        let tree = InternalNodes::create(
            store.clone(),
            xid,
            config.internal_region_pages,
            config.datapage_region_pages,
            config.index_fanout,
        )?;
        let bloom = config
            .bloom_enabled()
            .then(|| BloomFilter::with_rate(config.bloom_filter_size, config.bloom_fp_rate));

        debug!(
            root = %tree.root(),
            datapage_size = config.datapage_size,
            fanout = config.index_fanout,
            bloom = bloom.is_some(),
            "created component"
        );

        Ok(Self {
            store,
            tree,
            state: WriteState::Building {
                page: None,
                last_key: None,
            },
            datapage_size: config.datapage_size,
            stats,
            bloom,
            origin: Origin::FreshBuild,
            open_iterators: Arc::new(AtomicUsize::new(0)),
            deallocated: false,
        })
    }

    /// Reopens a finalized component from its locators.
    pub fn open(
        store: Arc<dyn PageStore>,
        xid: Xid,
        locators: RunLocators,
        stats: Arc<dyn MergeStats>,
    ) -> Result<Self> {
        let tree = InternalNodes::open(
            store.clone(),
            xid,
            locators.root,
            locators.internal_node_state,
            locators.datapage_state,
        )?;
        debug!(root = %tree.root(), depth = tree.depth(), "reopened component");

        Ok(Self {
            store,
            tree,
            state: WriteState::Finalized,
            datapage_size: 0,
            stats,
            bloom: None,
            origin: Origin::Reopened,
            open_iterators: Arc::new(AtomicUsize::new(0)),
            deallocated: false,
        })
    }

    fn ensure_live(&self) -> Result<()> {
        if self.deallocated {
            return Err(StrataError::AlreadyDeallocated);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_live()?;
        match self.state {
            WriteState::Building { .. } => Ok(()),
            WriteState::Failed => Err(StrataError::BuildFailed),
            WriteState::Finalized => Err(StrataError::WritesDone),
        }
    }

    /// Marks the build as failed and hands back the error that caused it.
    fn fail_build(&mut self, err: StrataError) -> StrataError {
        warn!(root = %self.tree.root(), error = %err, "component build failed");
        self.state = WriteState::Failed;
        err
    }

    /// Appends a tuple. Keys must arrive in non-decreasing order.
    ///
    /// If writing out a full data page fails, the component stops accepting
    /// writes and every later `insert_tuple` or `writes_done` returns
    /// [`StrataError::BuildFailed`]. The regions can still be released with
    /// `dealloc`.
    pub fn insert_tuple(&mut self, xid: Xid, tuple: &DataTuple) -> Result<()> {
        self.ensure_writable()?;
        let WriteState::Building { page, last_key } = &mut self.state else {
            return Err(StrataError::WritesDone);
        };

        let key = tuple.key();
        if key.len() > MAX_KEY_SIZE {
            return Err(StrataError::KeyTooLarge {
                size: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        if let Some(last) = last_key
            && key[..] < last[..]
        {
            return Err(StrataError::KeysNotSorted {
                previous: last.to_vec(),
                next: key.to_vec(),
            });
        }
        let max = DataPage::max_tuple_size_for(self.datapage_size);
        if tuple.encoded_size() > max || !tuple.is_encodable() {
            return Err(StrataError::TupleTooLarge {
                size: tuple.encoded_size(),
                capacity: max,
            });
        }

        // The open page stays in place until it is full, so a failed
        // allocation or append leaves every acknowledged tuple where it was.
        if page.is_none() {
            *page = Some(DataPage::create(
                self.tree.alloc_data_page(xid)?,
                self.datapage_size,
            ));
        }
        let full = match page.as_mut() {
            Some(open) => !open.append(tuple)?,
            None => false,
        };
        if full {
            if let Some(done) = page.take()
                && let Err(e) =
                    finish_page(&mut self.tree, self.store.as_ref(), self.stats.as_ref(), xid, done)
            {
                return Err(self.fail_build(e));
            }
            let mut next = DataPage::create(self.tree.alloc_data_page(xid)?, self.datapage_size);
            if !next.append(tuple)? {
                return Err(StrataError::Internal(format!(
                    "tuple of {} bytes rejected by an empty data page",
                    tuple.encoded_size()
                )));
            }
            *page = Some(next);
        }
        *last_key = Some(key.clone());

        if let Some(bloom) = &mut self.bloom {
            bloom.insert(key);
        }
        self.stats.tuple_inserted(tuple.encoded_size());
        Ok(())
    }

    /// Finalizes the open data page and the index. No inserts are accepted
    /// afterwards. A failure here leaves the build failed, as in
    /// `insert_tuple`.
    pub fn writes_done(&mut self, xid: Xid) -> Result<()> {
        self.ensure_writable()?;
        let WriteState::Building { page, .. } = &mut self.state else {
            return Err(StrataError::WritesDone);
        };

        let open = page.take();
        if let Err(e) = self.finish_build(xid, open) {
            return Err(self.fail_build(e));
        }
        self.state = WriteState::Finalized;
        self.stats.writes_done();

        info!(
            root = %self.tree.root(),
            depth = self.tree.depth(),
            datapages = self.tree.datapage_allocator().pages_allocated(),
            "component finalized"
        );
        if let Some(bloom) = &self.bloom {
            bloom.log_stats();
        }
        Ok(())
    }

    fn finish_build(&mut self, xid: Xid, open: Option<DataPage>) -> Result<()> {
        if let Some(open) = open
            && !open.is_empty()
        {
            finish_page(&mut self.tree, self.store.as_ref(), self.stats.as_ref(), xid, open)?;
        }
        self.tree.finalize(xid)
    }

    /// Returns true if a page write failed during the build.
    pub fn is_failed(&self) -> bool {
        matches!(self.state, WriteState::Failed)
    }

    /// Returns true once `writes_done` has run (or the component was
    /// reopened).
    pub fn is_finalized(&self) -> bool {
        matches!(self.state, WriteState::Finalized)
    }

    /// Point lookup. Returns the first tuple with exactly `key` in the data
    /// page whose range covers it.
    pub fn find_tuple(&self, xid: Xid, key: &[u8]) -> Result<Option<DataTuple>> {
        self.ensure_live()?;

        if let Some(bloom) = &self.bloom
            && !bloom.might_contain(key)
        {
            debug!(key_len = key.len(), "bloom filter excluded key");
            return Ok(None);
        }

        // The open page is not in the index yet.
        if let WriteState::Building { page: Some(open), .. } = &self.state
            && open.first_key().is_some_and(|first| first[..] <= *key)
        {
            return open.find(key);
        }

        match self.tree.find_page(xid, key)? {
            Some(page_id) => DataPage::load(self.store.as_ref(), xid, page_id)?.find(key),
            None => Ok(None),
        }
    }

    /// Opens an iterator over every tuple, optionally paced by a throttle
    /// hook.
    pub fn open_iterator(
        &self,
        xid: Xid,
        throttle: Option<ThrottleHook>,
    ) -> Result<ComponentIterator> {
        self.ensure_readable()?;
        let index = self.tree.iter(xid)?;
        Ok(ComponentIterator::new(
            self.store.clone(),
            xid,
            index,
            None,
            throttle,
            IteratorGuard::register(&self.open_iterators),
        ))
    }

    /// Opens an iterator over the tuples with keys >= `key`, or over every
    /// tuple when `key` is None.
    pub fn open_iterator_from(&self, xid: Xid, key: Option<&[u8]>) -> Result<ComponentIterator> {
        let Some(key) = key else {
            return self.open_iterator(xid, None);
        };
        self.ensure_readable()?;
        let index = self.tree.iter_before(xid, key)?;
        Ok(ComponentIterator::new(
            self.store.clone(),
            xid,
            index,
            Some(Bytes::copy_from_slice(key)),
            None,
            IteratorGuard::register(&self.open_iterators),
        ))
    }

    fn ensure_readable(&self) -> Result<()> {
        self.ensure_live()?;
        if !self.is_finalized() {
            return Err(StrataError::NotFinalized);
        }
        Ok(())
    }

    /// Number of iterators not yet closed or dropped.
    pub fn open_iterator_count(&self) -> usize {
        self.open_iterators.load(Ordering::Acquire)
    }

    /// Makes every written page durable. Regions are retained.
    pub fn force(&self, xid: Xid) -> Result<()> {
        self.ensure_live()?;
        self.store.force(xid)
    }

    /// Frees every extent of both regions.
    pub fn dealloc(&mut self, xid: Xid) -> Result<()> {
        self.ensure_live()?;
        let open = self.open_iterator_count();
        if open > 0 {
            warn!(open, root = %self.tree.root(), "refusing to deallocate component with open iterators");
            return Err(StrataError::IteratorsOutstanding(open));
        }

        let listing = self.list_regions();
        self.tree.dealloc(xid)?;
        self.state = WriteState::Finalized;
        self.bloom = None;
        self.deallocated = true;

        info!(
            internal_node_extents = listing.internal_node_regions.len(),
            datapage_extents = listing.datapage_regions.len(),
            pages = listing.total_pages(),
            "component deallocated"
        );
        Ok(())
    }

    /// Extents held by the component. Empty after `dealloc`.
    pub fn list_regions(&self) -> RegionListing {
        if self.deallocated {
            return RegionListing::default();
        }
        let (internal, datapages) = self.tree.list_regions();
        RegionListing {
            internal_node_region_length: self.tree.internal_node_allocator().region_length(),
            internal_node_regions: internal.iter().map(|e| e.start).collect(),
            datapage_region_length: self.tree.datapage_allocator().region_length(),
            datapage_regions: datapages.iter().map(|e| e.start).collect(),
        }
    }

    /// Locators needed to reopen the component.
    pub fn locators(&self) -> RunLocators {
        RunLocators {
            root: self.root_rid(),
            internal_node_state: self.internal_node_allocator_rid(),
            datapage_state: self.datapage_allocator_rid(),
        }
    }

    /// Locator of the index root.
    pub fn root_rid(&self) -> RecordId {
        self.tree.root_rid()
    }

    /// Locator of the index node allocator state.
    pub fn internal_node_allocator_rid(&self) -> RecordId {
        self.tree.internal_node_allocator().state_rid()
    }

    /// Locator of the data page allocator state.
    pub fn datapage_allocator_rid(&self) -> RecordId {
        self.tree.datapage_allocator().state_rid()
    }

    /// Logs the index shape.
    pub fn print_tree(&self, xid: Xid) -> Result<()> {
        self.ensure_live()?;
        self.tree.print_tree(xid)
    }

    /// The index tree and its two region allocators.
    pub fn internal_nodes(&self) -> &InternalNodes {
        &self.tree
    }

    /// Bloom filter, if one was configured and the run was built here.
    pub fn bloom_filter(&self) -> Option<&BloomFilter> {
        self.bloom.as_ref()
    }

    /// Whether this handle built the run or reopened it.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Statistics sink notified during the build.
    pub fn stats(&self) -> &Arc<dyn MergeStats> {
        &self.stats
    }
}

/// Writes a full data page and registers it in the index.
fn finish_page(
    tree: &mut InternalNodes,
    store: &dyn PageStore,
    stats: &dyn MergeStats,
    xid: Xid,
    mut page: DataPage,
) -> Result<()> {
    let Some(first_key) = page.first_key() else {
        return Err(StrataError::Internal(format!(
            "data page {} finalized while empty",
            page.page_id()
        )));
    };
    page.finalize(store, xid)?;
    tree.append_page(xid, &first_key, page.page_id())?;
    stats.datapage_finalized(page.page_id(), page.len(), page.payload_bytes());
    debug!(
        page = %page.page_id(),
        tuples = page.len(),
        bytes = page.payload_bytes(),
        "finalized data page"
    );
    Ok(())
}

impl std::fmt::Debug for DiskTreeComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskTreeComponent")
            .field("root", &self.tree.root())
            .field("depth", &self.tree.depth())
            .field("finalized", &self.is_finalized())
            .field("failed", &self.is_failed())
            .field("origin", &self.origin)
            .field("bloom", &self.bloom.is_some())
            .field("open_iterators", &self.open_iterator_count())
            .field("deallocated", &self.deallocated)
            .finish_non_exhaustive()
    }
}
