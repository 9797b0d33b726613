//! Index node page.
//!
//! Every level of the index uses the same node format. Entries are appended
//! in key order; nodes are never split or rebalanced.
//!
//! Page layout:
//! ```text
//! +---------------------+
//! | Page Header (32)    |
//! +---------------------+
//! | Node Header (8)     |
//! +---------------------+
//! | Slot Array          |  <- Grows forward, one u16 offset per entry
//! +---------------------+
//! | Free Space          |
//! +---------------------+
//! | Entries             |  <- Grow backward from the end of the page
//! +---------------------+
//! ```
//!
//! Entry layout: key_len (2) | key | page pointer (8).

use super::constants::{
    KEY_LEN_SIZE, NODE_HEADER_OFFSET, NODE_HEADER_SIZE, POINTER_SIZE, SLOT_ARRAY_START, SLOT_SIZE,
};
use crate::store::PageStore;
use strata_common::page::{PageHeader, PageId, PageType, PAGE_SIZE};
use strata_common::{RecordId, Result, StrataError, Xid};

/// Index node header.
#[derive(Debug, Clone, Copy)]
pub struct NodeHeader {
    /// Number of entries in the node.
    pub num_entries: u16,
    /// Distance from the leaf level (0 = entries point at data pages).
    pub level: u16,
    /// Offset of the lowest entry byte.
    pub data_end: u16,
}

impl NodeHeader {
    /// Size of the node header in bytes.
    pub const SIZE: usize = NODE_HEADER_SIZE;

    fn new(level: u16) -> Self {
        Self {
            num_entries: 0,
            level,
            data_end: PAGE_SIZE as u16,
        }
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.num_entries.to_le_bytes());
        buf[2..4].copy_from_slice(&self.level.to_le_bytes());
        buf[4..6].copy_from_slice(&self.data_end.to_le_bytes());
        buf
    }

    /// Deserializes the header from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            num_entries: u16::from_le_bytes([buf[0], buf[1]]),
            level: u16::from_le_bytes([buf[2], buf[3]]),
            data_end: u16::from_le_bytes([buf[4], buf[5]]),
        }
    }
}

/// In-memory copy of one index node page.
#[derive(Clone)]
pub struct IndexNode {
    page_id: PageId,
    data: Box<[u8; PAGE_SIZE]>,
}

impl IndexNode {
    /// Creates an empty node at `level`.
    pub fn new(page_id: PageId, level: u16) -> Self {
        let mut data = Box::new([0u8; PAGE_SIZE]);

        let page_header = PageHeader::new(page_id, PageType::IndexNode);
        data[..PageHeader::SIZE].copy_from_slice(&page_header.to_bytes());

        let header = NodeHeader::new(level);
        data[NODE_HEADER_OFFSET..SLOT_ARRAY_START].copy_from_slice(&header.to_bytes());

        Self { page_id, data }
    }

    /// Reads and validates a node from the store.
    pub fn load(store: &dyn PageStore, xid: Xid, page_id: PageId) -> Result<Self> {
        let data = store.read_page(xid, page_id)?;
        Self::from_page(page_id, data)
    }

    /// Validates raw page bytes as an index node.
    pub fn from_page(page_id: PageId, data: Box<[u8; PAGE_SIZE]>) -> Result<Self> {
        let corrupted = |reason: String| {
            StrataError::IndexCorrupted(format!("node {}: {}", page_id, reason))
        };

        let page_header = PageHeader::from_bytes(&data[..PageHeader::SIZE]);
        if page_header.page_type != PageType::IndexNode {
            return Err(corrupted(format!(
                "expected index node, found {:?}",
                page_header.page_type
            )));
        }

        let header = NodeHeader::from_bytes(&data[NODE_HEADER_OFFSET..SLOT_ARRAY_START]);
        let slots_end = SLOT_ARRAY_START + header.num_entries as usize * SLOT_SIZE;
        if slots_end > header.data_end as usize || header.data_end as usize > PAGE_SIZE {
            return Err(corrupted(format!(
                "bad header: {} entries, data end {}",
                header.num_entries, header.data_end
            )));
        }

        for i in 0..header.num_entries as usize {
            let pos = SLOT_ARRAY_START + i * SLOT_SIZE;
            let offset = u16::from_le_bytes([data[pos], data[pos + 1]]) as usize;
            if offset < header.data_end as usize || offset + KEY_LEN_SIZE > PAGE_SIZE {
                return Err(corrupted(format!("slot {} offset {} out of range", i, offset)));
            }
            let key_len = u16::from_le_bytes([data[offset], data[offset + 1]]) as usize;
            if offset + KEY_LEN_SIZE + key_len + POINTER_SIZE > PAGE_SIZE {
                return Err(corrupted(format!("entry {} runs past the page", i)));
            }
        }

        Ok(Self { page_id, data })
    }

    /// Writes the node to the store.
    pub fn write(&self, store: &dyn PageStore, xid: Xid) -> Result<()> {
        store.write_page(xid, self.page_id, &self.data)
    }

    fn header(&self) -> NodeHeader {
        NodeHeader::from_bytes(&self.data[NODE_HEADER_OFFSET..SLOT_ARRAY_START])
    }

    fn set_header(&mut self, header: NodeHeader) {
        self.data[NODE_HEADER_OFFSET..SLOT_ARRAY_START].copy_from_slice(&header.to_bytes());
    }

    /// Returns the page id.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the node's level.
    pub fn level(&self) -> u16 {
        self.header().level
    }

    /// Returns the number of entries.
    pub fn num_entries(&self) -> usize {
        self.header().num_entries as usize
    }

    /// Returns true if the node holds no entries.
    pub fn is_empty(&self) -> bool {
        self.num_entries() == 0
    }

    /// Bytes left between the slot array and the entries.
    pub fn free_space(&self) -> usize {
        let header = self.header();
        let slots_end = SLOT_ARRAY_START + header.num_entries as usize * SLOT_SIZE;
        (header.data_end as usize).saturating_sub(slots_end)
    }

    /// Bytes an entry with a key of `key_len` bytes occupies, slot included.
    pub fn entry_space(key_len: usize) -> usize {
        SLOT_SIZE + KEY_LEN_SIZE + key_len + POINTER_SIZE
    }

    /// Returns true if no further entry with a key of `key_len` bytes may be
    /// appended. A `fanout` of 0 leaves the page size as the only limit.
    pub fn is_full(&self, fanout: usize, key_len: usize) -> bool {
        (fanout > 0 && self.num_entries() >= fanout) || Self::entry_space(key_len) > self.free_space()
    }

    /// Appends an entry after all existing ones and returns its index.
    pub fn push(&mut self, key: &[u8], page: PageId) -> Result<usize> {
        if Self::entry_space(key.len()) > self.free_space() {
            return Err(StrataError::NodeFull);
        }

        let mut header = self.header();
        let entry_len = KEY_LEN_SIZE + key.len() + POINTER_SIZE;
        let offset = header.data_end as usize - entry_len;

        self.data[offset..offset + KEY_LEN_SIZE].copy_from_slice(&(key.len() as u16).to_le_bytes());
        let key_end = offset + KEY_LEN_SIZE + key.len();
        self.data[offset + KEY_LEN_SIZE..key_end].copy_from_slice(key);
        self.data[key_end..key_end + POINTER_SIZE].copy_from_slice(&page.as_u64().to_le_bytes());

        let idx = header.num_entries as usize;
        let slot_pos = SLOT_ARRAY_START + idx * SLOT_SIZE;
        self.data[slot_pos..slot_pos + SLOT_SIZE].copy_from_slice(&(offset as u16).to_le_bytes());

        header.num_entries += 1;
        header.data_end = offset as u16;
        self.set_header(header);
        Ok(idx)
    }

    fn entry_offset(&self, idx: usize) -> usize {
        let pos = SLOT_ARRAY_START + idx * SLOT_SIZE;
        u16::from_le_bytes([self.data[pos], self.data[pos + 1]]) as usize
    }

    fn key_len_at(&self, offset: usize) -> usize {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]]) as usize
    }

    /// Key of entry `idx`.
    pub fn key_at(&self, idx: usize) -> &[u8] {
        let offset = self.entry_offset(idx);
        let start = offset + KEY_LEN_SIZE;
        &self.data[start..start + self.key_len_at(offset)]
    }

    /// Page pointer of entry `idx`.
    pub fn pointer_at(&self, idx: usize) -> PageId {
        let offset = self.entry_offset(idx);
        let start = offset + KEY_LEN_SIZE + self.key_len_at(offset);
        decode_pointer(&self.data[start..start + POINTER_SIZE])
    }

    /// Locator of entry `idx` within this node's page.
    pub fn entry_rid(&self, idx: usize) -> RecordId {
        let offset = self.entry_offset(idx);
        let len = KEY_LEN_SIZE + self.key_len_at(offset) + POINTER_SIZE;
        RecordId::new(
            self.page_id,
            (offset - PageHeader::SIZE) as u16,
            len as u16,
        )
    }

    /// Index of the last entry whose key is <= `key`, or None if `key` sorts
    /// before every entry.
    pub fn search(&self, key: &[u8]) -> Option<usize> {
        self.partition_point(|k| k <= key).checked_sub(1)
    }

    /// Returns the index of the last entry whose key is strictly less than
    /// `key`, or None if every entry is >= `key`.
    pub fn search_before(&self, key: &[u8]) -> Option<usize> {
        self.partition_point(|k| k < key).checked_sub(1)
    }

    /// Number of leading entries whose keys satisfy `pred`.
    fn partition_point(&self, pred: impl Fn(&[u8]) -> bool) -> usize {
        let mut lo = 0;
        let mut hi = self.num_entries();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(self.key_at(mid)) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Copies this node's entries into a node on another page.
    pub fn relocate(&self, page_id: PageId) -> Self {
        let mut data = self.data.clone();
        let mut page_header = PageHeader::from_bytes(&data[..PageHeader::SIZE]);
        page_header.page_id = page_id;
        data[..PageHeader::SIZE].copy_from_slice(&page_header.to_bytes());
        Self { page_id, data }
    }

    /// Marks the node as complete.
    pub fn set_finalized(&mut self) {
        let mut page_header = PageHeader::from_bytes(&self.data[..PageHeader::SIZE]);
        page_header.flags.set_finalized(true);
        self.data[..PageHeader::SIZE].copy_from_slice(&page_header.to_bytes());
    }
}

impl std::fmt::Debug for IndexNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexNode")
            .field("page_id", &self.page_id)
            .field("level", &self.level())
            .field("entries", &self.num_entries())
            .field("free_space", &self.free_space())
            .finish()
    }
}

/// Decodes the page pointer at the end of an index entry record.
pub(crate) fn decode_pointer(buf: &[u8]) -> PageId {
    let mut bytes = [0u8; POINTER_SIZE];
    bytes.copy_from_slice(&buf[..POINTER_SIZE]);
    PageId::from_u64(u64::from_le_bytes(bytes))
}
