//! Sorted-run storage for Strata.
//!
//! This crate provides:
//! - Page stores (in-memory arena and single-file) with region reservation
//! - Region allocator handing out pages from growable extents
//! - Tuple representation and serialization
//! - Leaf data pages of sorted tuples
//! - Bulk-built index tree over leaf pages, with its leaf-level iterator
//! - Bloom filter for negative lookups
//! - The sorted-run component tying them together, with its tuple iterator
//!   and merge scheduler hooks

mod bloom;
mod component;
mod datapage;
mod disk;
mod region;
mod store;
mod tree;
mod tuple;

pub use bloom::BloomFilter;
pub use component::{
    ComponentIterator, DiskTreeComponent, FlushSignal, IterProgress, MergeManager, MergeStats,
    NoopStats, Origin, RegionListing, RunLocators, RunStats, RunStatsSnapshot, ThrottleHook,
};
pub use datapage::{DataPage, DataPageIter};
pub use disk::FilePageStore;
pub use region::RegionAllocator;
pub use store::{MemPageStore, PageStore};
pub use tree::{
    IndexEntry, IndexIterator, IndexNode, InternalNodes, MAX_DEPTH, MAX_KEY_SIZE, NodeHeader,
    TreeSummary,
};
pub use tuple::{DataTuple, TupleFlags, TupleHeader};
