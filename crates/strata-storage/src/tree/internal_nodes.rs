//! Bulk-built index tree over leaf data pages.
//!
//! Keys arrive in sorted order, one per finalized data page. The tree keeps
//! the rightmost open node of every level (the spine) and only ever appends
//! to it. When a spine node fills, a sibling is started at the same level and
//! linked into the parent, recursively. When the root fills, its contents
//! move to a fresh page and the root page becomes their parent, so the root
//! page id never changes.
//!
//! Each entry's key is the inclusive lower bound of the range its pointer
//! covers; the range ends at the next entry's key.

use super::constants::{MAX_DEPTH, MAX_KEY_SIZE};
use super::iterator::IndexIterator;
use super::node::{decode_pointer, IndexNode, NodeHeader};
use crate::region::RegionAllocator;
use crate::store::PageStore;
use bytes::Bytes;
use std::sync::Arc;
use strata_common::page::PageId;
use strata_common::{Extent, RecordId, Result, StrataError, Xid};
use tracing::{debug, info};

/// Build-time state, dropped at finalize.
struct BuildState {
    /// Open rightmost node per level; the last one is the root.
    spine: Vec<IndexNode>,
    /// Last key appended at the leaf level.
    last_key: Option<Bytes>,
}

/// Leaf-level node reached by a descent.
pub(crate) struct Descent {
    /// Leaf-level node.
    pub(crate) leaf: IndexNode,
    /// Chosen entry in the leaf-level node.
    pub(crate) pos: usize,
}

/// Shape of a built tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeSummary {
    /// Number of levels, root included.
    pub depth: usize,
    /// Node count per level, leaf level first.
    pub nodes_per_level: Vec<usize>,
    /// Number of leaf-level entries (registered data pages).
    pub leaf_entries: usize,
}

/// Index tree mapping key ranges to leaf data pages.
pub struct InternalNodes {
    store: Arc<dyn PageStore>,
    /// Root page; stable for the tree's lifetime.
    root: PageId,
    /// Number of levels, root included.
    depth: usize,
    /// Region holding index nodes.
    internal_node_alloc: RegionAllocator,
    /// Region holding leaf data pages.
    datapage_alloc: RegionAllocator,
    /// Maximum entries per node (0 = limited by page space).
    fanout: usize,
    /// Present while building.
    build: Option<BuildState>,
}

impl InternalNodes {
    /// Reserves both regions and writes an empty root.
    pub fn create(
        store: Arc<dyn PageStore>,
        xid: Xid,
        internal_region_pages: u64,
        datapage_region_pages: u64,
        fanout: usize,
    ) -> Result<Self> {
        let mut internal_node_alloc =
            RegionAllocator::create(store.clone(), xid, internal_region_pages)?;
        let datapage_alloc = RegionAllocator::create(store.clone(), xid, datapage_region_pages)?;

        let root = internal_node_alloc.alloc_page(xid)?;
        let root_node = IndexNode::new(root, 0);
        root_node.write(store.as_ref(), xid)?;

        debug!(root = %root, fanout, "created index tree");

        Ok(Self {
            store,
            root,
            depth: 1,
            internal_node_alloc,
            datapage_alloc,
            fanout,
            build: Some(BuildState {
                spine: vec![root_node],
                last_key: None,
            }),
        })
    }

    /// Reopens a finalized tree from its three locators.
    pub fn open(
        store: Arc<dyn PageStore>,
        xid: Xid,
        root_rid: RecordId,
        internal_node_state: RecordId,
        datapage_state: RecordId,
    ) -> Result<Self> {
        if root_rid.slot != 0 || root_rid.size as usize != NodeHeader::SIZE {
            return Err(StrataError::InvalidLocator {
                page_id: root_rid.page.as_u64(),
                slot: root_rid.slot,
                size: root_rid.size,
                reason: "not an index root locator".to_string(),
            });
        }

        let internal_node_alloc =
            RegionAllocator::open(store.clone(), xid, internal_node_state)?;
        let datapage_alloc = RegionAllocator::open(store.clone(), xid, datapage_state)?;

        let root_node = IndexNode::load(store.as_ref(), xid, root_rid.page)?;
        let depth = root_node.level() as usize + 1;
        if depth > MAX_DEPTH {
            return Err(StrataError::IndexCorrupted(format!(
                "root {} claims depth {}",
                root_rid.page, depth
            )));
        }

        Ok(Self {
            store,
            root: root_rid.page,
            depth,
            internal_node_alloc,
            datapage_alloc,
            fanout: 0,
            build: None,
        })
    }

    /// Registers `page` as the target of every key >= `key` and below the next
    /// appended key. Returns the locator of the new leaf-level entry.
    ///
    /// Locators of entries held by the root move when the root grows; use
    /// `lookup` once the tree is finalized for stable ones.
    pub fn append_page(&mut self, xid: Xid, key: &[u8], page: PageId) -> Result<RecordId> {
        let build = self.build.as_ref().ok_or(StrataError::TreeFinalized)?;
        if key.len() > MAX_KEY_SIZE {
            return Err(StrataError::KeyTooLarge {
                size: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        if let Some(last) = &build.last_key
            && key < &last[..]
        {
            return Err(StrataError::KeysNotSorted {
                previous: last.to_vec(),
                next: key.to_vec(),
            });
        }

        let rid = self.append_at(xid, 0, key, page)?;
        if let Some(build) = self.build.as_mut() {
            build.last_key = Some(Bytes::copy_from_slice(key));
        }
        Ok(rid)
    }

    /// Appends an entry to the open node of `level`, extending the spine when
    /// that node is full.
    fn append_at(&mut self, xid: Xid, level: usize, key: &[u8], page: PageId) -> Result<RecordId> {
        let fanout = self.fanout;
        let store = self.store.clone();
        let full = self.spine()?[level].is_full(fanout, key.len());

        if !full {
            let node = &mut self.spine_mut()?[level];
            let idx = node.push(key, page)?;
            node.write(store.as_ref(), xid)?;
            return Ok(node.entry_rid(idx));
        }

        if level + 1 == self.spine()?.len() {
            self.grow_root(xid)?;
        }

        let sibling_id = self.internal_node_alloc.alloc_page(xid)?;
        let mut sibling = IndexNode::new(sibling_id, level as u16);
        let idx = sibling.push(key, page)?;
        sibling.write(store.as_ref(), xid)?;
        let rid = sibling.entry_rid(idx);
        self.spine_mut()?[level] = sibling;

        self.append_at(xid, level + 1, key, sibling_id)?;
        Ok(rid)
    }

    /// Moves the root's entries to a new page and makes the root their parent.
    fn grow_root(&mut self, xid: Xid) -> Result<()> {
        if self.depth == MAX_DEPTH {
            return Err(StrataError::Internal(format!(
                "index tree reached its depth limit of {}",
                MAX_DEPTH
            )));
        }

        let moved_id = self.internal_node_alloc.alloc_page(xid)?;
        let root = self.root;
        let store = self.store.clone();
        let spine = self.spine_mut()?;
        let top = spine.len() - 1;

        let moved = spine[top].relocate(moved_id);
        moved.write(store.as_ref(), xid)?;

        let mut new_root = IndexNode::new(root, (top + 1) as u16);
        new_root.push(moved.key_at(0), moved_id)?;
        new_root.write(store.as_ref(), xid)?;

        spine[top] = moved;
        spine.push(new_root);
        self.depth += 1;

        debug!(root = %root, moved = %moved_id, depth = self.depth, "index root grew");
        Ok(())
    }

    fn spine(&self) -> Result<&[IndexNode]> {
        self.build
            .as_ref()
            .map(|build| build.spine.as_slice())
            .ok_or(StrataError::TreeFinalized)
    }

    fn spine_mut(&mut self) -> Result<&mut Vec<IndexNode>> {
        self.build
            .as_mut()
            .map(|build| &mut build.spine)
            .ok_or(StrataError::TreeFinalized)
    }

    /// Freezes the tree. Depth is fixed from here on.
    pub fn finalize(&mut self, xid: Xid) -> Result<()> {
        let build = self.build.take().ok_or(StrataError::TreeFinalized)?;
        for mut node in build.spine {
            node.set_finalized();
            node.write(self.store.as_ref(), xid)?;
        }
        debug!(root = %self.root, depth = self.depth, "index tree finalized");
        Ok(())
    }

    /// Returns true once `finalize` has run.
    pub fn is_finalized(&self) -> bool {
        self.build.is_none()
    }

    /// Descends to the leaf-level entry covering `key`. Returns None when
    /// `key` sorts before every entry.
    pub(crate) fn descend(&self, xid: Xid, key: &[u8]) -> Result<Option<Descent>> {
        let mut node = IndexNode::load(self.store.as_ref(), xid, self.root)?;

        loop {
            let Some(idx) = node.search(key) else {
                if node.page_id() == self.root {
                    return Ok(None);
                }
                return Err(StrataError::IndexCorrupted(format!(
                    "node {} has no entry for a key its parent routed to it",
                    node.page_id()
                )));
            };

            if node.level() == 0 {
                return Ok(Some(Descent {
                    leaf: node,
                    pos: idx,
                }));
            }

            node = load_child(self.store.as_ref(), xid, &node, idx)?;
        }
    }

    /// Returns the data page whose range covers `key`.
    pub fn find_page(&self, xid: Xid, key: &[u8]) -> Result<Option<PageId>> {
        Ok(self
            .descend(xid, key)?
            .map(|descent| descent.leaf.pointer_at(descent.pos)))
    }

    /// Returns the locator of the leaf-level entry covering `key`.
    pub fn lookup(&self, xid: Xid, key: &[u8]) -> Result<Option<RecordId>> {
        Ok(self
            .descend(xid, key)?
            .map(|descent| descent.leaf.entry_rid(descent.pos)))
    }

    /// Reads the data page pointer back from a leaf-level entry locator.
    pub fn lookup_leaf_page_from_rid(&self, xid: Xid, rid: RecordId) -> Result<PageId> {
        let record = self.store.read_record(xid, rid)?;
        let bad = |reason: &str| StrataError::InvalidLocator {
            page_id: rid.page.as_u64(),
            slot: rid.slot,
            size: rid.size,
            reason: reason.to_string(),
        };
        if record.len() < 10 {
            return Err(bad("record too small for an index entry"));
        }
        let key_len = u16::from_le_bytes([record[0], record[1]]) as usize;
        if 2 + key_len + 8 != record.len() {
            return Err(bad("record is not an index entry"));
        }
        Ok(decode_pointer(&record[2 + key_len..]))
    }

    /// Leftmost leaf-level node, or None for an empty tree.
    pub fn find_first_leaf(&self, xid: Xid) -> Result<Option<PageId>> {
        self.find_edge_leaf(xid, |_| 0)
    }

    /// Rightmost leaf-level node, or None for an empty tree.
    pub fn find_last_leaf(&self, xid: Xid) -> Result<Option<PageId>> {
        self.find_edge_leaf(xid, |node| node.num_entries() - 1)
    }

    fn find_edge_leaf(
        &self,
        xid: Xid,
        pick: impl Fn(&IndexNode) -> usize,
    ) -> Result<Option<PageId>> {
        let mut node = IndexNode::load(self.store.as_ref(), xid, self.root)?;
        if node.is_empty() {
            return Ok(None);
        }
        while node.level() > 0 {
            if node.is_empty() {
                return Err(StrataError::IndexCorrupted(format!(
                    "interior node {} is empty",
                    node.page_id()
                )));
            }
            node = load_child(self.store.as_ref(), xid, &node, pick(&node))?;
        }
        Ok(Some(node.page_id()))
    }

    /// Iterates over every leaf-level entry in key order.
    pub fn iter(&self, xid: Xid) -> Result<IndexIterator> {
        IndexIterator::new(self.store.clone(), xid, self.root)
    }

    /// Iterates from the leaf-level entry covering `key`.
    pub fn iter_from(&self, xid: Xid, key: &[u8]) -> Result<IndexIterator> {
        IndexIterator::seek(self.store.clone(), xid, self.root, key)
    }

    /// Iterates from the first leaf-level entry whose page can hold a key
    /// >= `key`.
    pub fn iter_before(&self, xid: Xid, key: &[u8]) -> Result<IndexIterator> {
        IndexIterator::seek_before(self.store.clone(), xid, self.root, key)
    }

    /// Counts nodes per level by walking the tree breadth first.
    pub fn tree_summary(&self, xid: Xid) -> Result<TreeSummary> {
        let mut nodes_per_level = vec![0usize; self.depth];
        let mut frontier = vec![self.root];
        let mut leaf_entries = 0;

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for page_id in frontier {
                let node = IndexNode::load(self.store.as_ref(), xid, page_id)?;
                let level = node.level() as usize;
                if level >= self.depth {
                    return Err(StrataError::IndexCorrupted(format!(
                        "node {} at level {} in a tree of depth {}",
                        page_id, level, self.depth
                    )));
                }
                nodes_per_level[level] += 1;
                if level == 0 {
                    leaf_entries += node.num_entries();
                } else {
                    next.extend((0..node.num_entries()).map(|i| node.pointer_at(i)));
                }
            }
            frontier = next;
        }

        Ok(TreeSummary {
            depth: self.depth,
            nodes_per_level,
            leaf_entries,
        })
    }

    /// Logs the tree shape.
    pub fn print_tree(&self, xid: Xid) -> Result<()> {
        let summary = self.tree_summary(xid)?;
        info!(
            root = %self.root,
            depth = summary.depth,
            leaf_entries = summary.leaf_entries,
            "index tree"
        );
        for (level, count) in summary.nodes_per_level.iter().enumerate().rev() {
            info!(level, nodes = count, "index level");
        }

        let mut iter = self.iter(xid)?;
        while let Some(entry) = iter.next_entry()? {
            debug!(key = ?entry.key, page = %entry.page, "leaf entry");
        }
        Ok(())
    }

    /// Allocates a page from the data page region.
    pub fn alloc_data_page(&mut self, xid: Xid) -> Result<PageId> {
        self.datapage_alloc.alloc_page(xid)
    }

    /// Frees both regions.
    pub fn dealloc(&mut self, xid: Xid) -> Result<()> {
        self.build = None;
        self.datapage_alloc.dealloc(xid)?;
        self.internal_node_alloc.dealloc(xid)
    }

    /// Extents of the index node region and the data page region.
    pub fn list_regions(&self) -> (Vec<Extent>, Vec<Extent>) {
        (
            self.internal_node_alloc.list_extents(),
            self.datapage_alloc.list_extents(),
        )
    }

    /// Root page id.
    pub fn root(&self) -> PageId {
        self.root
    }

    /// Locator of the root node header.
    pub fn root_rid(&self) -> RecordId {
        RecordId::new(self.root, 0, NodeHeader::SIZE as u16)
    }

    /// Number of levels, root included.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Index node region allocator.
    pub fn internal_node_allocator(&self) -> &RegionAllocator {
        &self.internal_node_alloc
    }

    /// Data page region allocator.
    pub fn datapage_allocator(&self) -> &RegionAllocator {
        &self.datapage_alloc
    }
}

/// Loads child `idx` of `node` and checks it sits one level lower.
pub(crate) fn load_child(
    store: &dyn PageStore,
    xid: Xid,
    node: &IndexNode,
    idx: usize,
) -> Result<IndexNode> {
    let child = IndexNode::load(store, xid, node.pointer_at(idx))?;
    if child.level() + 1 != node.level() {
        return Err(StrataError::IndexCorrupted(format!(
            "node {} at level {} points to node {} at level {}",
            node.page_id(),
            node.level(),
            child.page_id(),
            child.level()
        )));
    }
    Ok(child)
}
