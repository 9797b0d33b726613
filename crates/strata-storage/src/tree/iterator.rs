//! Leaf-level traversal of the index tree.

use super::internal_nodes::load_child;
use super::node::IndexNode;
use crate::store::PageStore;
use bytes::Bytes;
use std::sync::Arc;
use strata_common::page::PageId;
use strata_common::{Result, StrataError, Xid};

/// One leaf-level entry: a key and the data page whose range starts there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Inclusive lower bound of the page's key range.
    pub key: Bytes,
    /// Leaf data page.
    pub page: PageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterState {
    Open,
    Exhausted,
    Closed,
}

/// Depth-first iterator over the leaf-level entries of an index tree.
///
/// Holds a copy of the current leaf-level node and the (page, entry) path to
/// it; ancestors are re-read from the store when the walk moves past the end
/// of a node.
pub struct IndexIterator {
    store: Arc<dyn PageStore>,
    xid: Xid,
    /// (node page, entry taken) for every level above the leaf level.
    path: Vec<(PageId, usize)>,
    /// Current leaf-level node.
    leaf: Option<IndexNode>,
    /// Next entry to emit from `leaf`.
    pos: usize,
    state: IterState,
}

impl IndexIterator {
    /// Positions the iterator before the first entry of the tree.
    pub fn new(store: Arc<dyn PageStore>, xid: Xid, root: PageId) -> Result<Self> {
        let root_node = IndexNode::load(store.as_ref(), xid, root)?;
        let mut iter = Self {
            store,
            xid,
            path: Vec::new(),
            leaf: None,
            pos: 0,
            state: IterState::Open,
        };
        if root_node.is_empty() {
            iter.state = IterState::Exhausted;
        } else {
            iter.descend_leftmost(root_node)?;
        }
        Ok(iter)
    }

    /// Positions the iterator at the entry whose range covers `key`, or at
    /// the first entry when `key` sorts before every entry.
    pub fn seek(store: Arc<dyn PageStore>, xid: Xid, root: PageId, key: &[u8]) -> Result<Self> {
        Self::seek_with(store, xid, root, key, IndexNode::search)
    }

    /// Positions the iterator at the first entry whose data page can hold a
    /// key >= `key`.
    ///
    /// Differs from [`seek`](Self::seek) only when `key` is an entry key:
    /// this starts one entry earlier, since a run of duplicates may begin on
    /// the previous page.
    pub fn seek_before(
        store: Arc<dyn PageStore>,
        xid: Xid,
        root: PageId,
        key: &[u8],
    ) -> Result<Self> {
        Self::seek_with(store, xid, root, key, IndexNode::search_before)
    }

    fn seek_with(
        store: Arc<dyn PageStore>,
        xid: Xid,
        root: PageId,
        key: &[u8],
        search: fn(&IndexNode, &[u8]) -> Option<usize>,
    ) -> Result<Self> {
        let mut node = IndexNode::load(store.as_ref(), xid, root)?;
        if node.is_empty() {
            return Self::new(store, xid, root);
        }

        let mut path = Vec::new();
        // No entry qualifies only when key sorts at or before the subtree's
        // first key; the first child is the right place then.
        let mut idx = search(&node, key).unwrap_or(0);
        while node.level() > 0 {
            let child = load_child(store.as_ref(), xid, &node, idx)?;
            path.push((node.page_id(), idx));
            node = child;
            idx = search(&node, key).unwrap_or(0);
        }

        Ok(Self {
            store,
            xid,
            path,
            leaf: Some(node),
            pos: idx,
            state: IterState::Open,
        })
    }

    /// Follows first children from `node` down to the leaf level.
    fn descend_leftmost(&mut self, mut node: IndexNode) -> Result<()> {
        while node.level() > 0 {
            if node.is_empty() {
                return Err(StrataError::IndexCorrupted(format!(
                    "interior node {} is empty",
                    node.page_id()
                )));
            }
            let child = load_child(self.store.as_ref(), self.xid, &node, 0)?;
            self.path.push((node.page_id(), 0));
            node = child;
        }
        self.leaf = Some(node);
        self.pos = 0;
        Ok(())
    }

    /// Moves to the next leaf-level node. Returns false at the end of the tree.
    fn advance_leaf(&mut self) -> Result<bool> {
        self.leaf = None;
        while let Some((page_id, idx)) = self.path.pop() {
            let node = IndexNode::load(self.store.as_ref(), self.xid, page_id)?;
            if idx + 1 < node.num_entries() {
                let child = load_child(self.store.as_ref(), self.xid, &node, idx + 1)?;
                self.path.push((page_id, idx + 1));
                self.descend_leftmost(child)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns the next entry, `Ok(None)` once the tree is exhausted.
    pub fn next_entry(&mut self) -> Result<Option<IndexEntry>> {
        match self.state {
            IterState::Closed => return Err(StrataError::IteratorClosed),
            IterState::Exhausted => return Ok(None),
            IterState::Open => {}
        }

        loop {
            if let Some(leaf) = &self.leaf
                && self.pos < leaf.num_entries()
            {
                let entry = IndexEntry {
                    key: Bytes::copy_from_slice(leaf.key_at(self.pos)),
                    page: leaf.pointer_at(self.pos),
                };
                self.pos += 1;
                return Ok(Some(entry));
            }

            match self.advance_leaf() {
                Ok(true) => {}
                Ok(false) => {
                    self.state = IterState::Exhausted;
                    return Ok(None);
                }
                Err(e) => {
                    self.state = IterState::Exhausted;
                    return Err(e);
                }
            }
        }
    }

    /// Releases the held node. Safe to call any number of times.
    pub fn close(&mut self) {
        self.leaf = None;
        self.path.clear();
        self.state = IterState::Closed;
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.state == IterState::Closed
    }
}

impl Iterator for IndexIterator {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state == IterState::Closed {
            return None;
        }
        self.next_entry().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemPageStore;
    use crate::tree::InternalNodes;

    const XID: Xid = Xid(1);

    fn key(i: u32) -> [u8; 4] {
        i.to_be_bytes()
    }

    fn build(count: u32, fanout: usize) -> (InternalNodes, Vec<PageId>) {
        let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new());
        let mut tree = InternalNodes::create(store, XID, 64, 64, fanout).unwrap();
        let mut pages = Vec::new();
        for i in 0..count {
            let page = tree.alloc_data_page(XID).unwrap();
            tree.append_page(XID, &key(i * 2), page).unwrap();
            pages.push(page);
        }
        tree.finalize(XID).unwrap();
        (tree, pages)
    }

    #[test]
    fn test_full_scan_in_order() {
        let (tree, pages) = build(50, 3);
        let entries: Vec<IndexEntry> = tree.iter(XID).unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 50);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.key.as_ref(), key(i as u32 * 2));
            assert_eq!(entry.page, pages[i]);
        }
    }

    #[test]
    fn test_single_node_scan() {
        let (tree, pages) = build(3, 8);
        let got: Vec<PageId> = tree.iter(XID).unwrap().map(|e| e.unwrap().page).collect();
        assert_eq!(got, pages);
    }

    #[test]
    fn test_seek_inside_and_on_boundary() {
        let (tree, pages) = build(40, 4);

        // Key 21 falls in the range starting at 20 (entry 10).
        let mut iter = tree.iter_from(XID, &key(21)).unwrap();
        assert_eq!(iter.next_entry().unwrap().unwrap().page, pages[10]);
        let rest = iter.count();
        assert_eq!(rest, 29);

        let mut iter = tree.iter_from(XID, &key(38)).unwrap();
        assert_eq!(iter.next_entry().unwrap().unwrap().page, pages[19]);
    }

    #[test]
    fn test_seek_before_starts_at_duplicate_run() {
        let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new());
        let mut tree = InternalNodes::create(store, XID, 16, 16, 2).unwrap();
        let mut pages = Vec::new();
        for k in [b"a", b"k", b"k", b"k", b"z"] {
            let page = tree.alloc_data_page(XID).unwrap();
            tree.append_page(XID, k, page).unwrap();
            pages.push(page);
        }
        tree.finalize(XID).unwrap();

        let mut iter = tree.iter_from(XID, b"k").unwrap();
        assert_eq!(iter.next_entry().unwrap().unwrap().page, pages[3]);

        // The previous page may end with "k" too.
        let mut iter = tree.iter_before(XID, b"k").unwrap();
        assert_eq!(iter.next_entry().unwrap().unwrap().page, pages[0]);
        assert_eq!(iter.count(), 4);

        let mut iter = tree.iter_before(XID, b"m").unwrap();
        assert_eq!(iter.next_entry().unwrap().unwrap().page, pages[3]);

        let mut iter = tree.iter_before(XID, b"a").unwrap();
        assert_eq!(iter.next_entry().unwrap().unwrap().page, pages[0]);
    }

    #[test]
    fn test_seek_before_first_entry() {
        let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new());
        let mut tree = InternalNodes::create(store, XID, 16, 16, 2).unwrap();
        for k in [b"m", b"n", b"o", b"p", b"q"] {
            let page = tree.alloc_data_page(XID).unwrap();
            tree.append_page(XID, k, page).unwrap();
        }
        let keys: Vec<Bytes> = tree
            .iter_from(XID, b"a")
            .unwrap()
            .map(|e| e.unwrap().key)
            .collect();
        assert_eq!(keys.len(), 5);
        assert_eq!(keys[0].as_ref(), b"m");
    }

    #[test]
    fn test_seek_past_last_entry() {
        let (tree, pages) = build(10, 3);
        let got: Vec<PageId> = tree
            .iter_from(XID, &key(1000))
            .unwrap()
            .map(|e| e.unwrap().page)
            .collect();
        assert_eq!(got, vec![pages[9]]);
    }

    #[test]
    fn test_empty_tree() {
        let (tree, _) = build(0, 3);
        let mut iter = tree.iter(XID).unwrap();
        assert_eq!(iter.next_entry().unwrap(), None);
        assert_eq!(iter.next_entry().unwrap(), None);
        let mut iter = tree.iter_from(XID, b"x").unwrap();
        assert_eq!(iter.next_entry().unwrap(), None);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (tree, _) = build(10, 3);

        let mut iter = tree.iter(XID).unwrap();
        iter.close();
        iter.close();
        assert!(iter.is_closed());
        assert!(matches!(iter.next_entry(), Err(StrataError::IteratorClosed)));
        assert!(iter.next().is_none());

        let mut iter = tree.iter(XID).unwrap();
        iter.next_entry().unwrap();
        iter.close();
        assert!(matches!(iter.next_entry(), Err(StrataError::IteratorClosed)));

        let mut iter = tree.iter(XID).unwrap();
        while iter.next_entry().unwrap().is_some() {}
        iter.close();
        iter.close();
    }

    #[test]
    fn test_exhausted_stays_exhausted() {
        let (tree, _) = build(5, 2);
        let mut iter = tree.iter(XID).unwrap();
        for _ in 0..5 {
            assert!(iter.next_entry().unwrap().is_some());
        }
        assert!(iter.next_entry().unwrap().is_none());
        assert!(iter.next_entry().unwrap().is_none());
    }
}
