//! Leaf data pages holding sorted tuples.
//!
//! Page layout:
//! ```text
//! +---------------------+
//! | Page Header (32)    |
//! +---------------------+
//! | Data Header (8)     |
//! +---------------------+
//! | Slot Array          |  <- Grows forward, one u16 offset per tuple
//! +---------------------+
//! | Free Space          |
//! +---------------------+
//! | Tuple Data          |  <- Grows backward from the capacity limit
//! +---------------------+
//! | Unused              |  <- Past the configured target size
//! +---------------------+
//! ```
//!
//! Tuples are appended in key order, so slot order is key order and lookups
//! binary search the slot array.

use crate::store::PageStore;
use crate::tuple::{DataTuple, TupleHeader};
use bytes::Bytes;
use strata_common::config::{MAX_DATAPAGE_SIZE, MIN_DATAPAGE_SIZE};
use strata_common::page::{PageHeader, PageId, PageType, PAGE_SIZE};
use strata_common::{Result, StrataError, Xid};

/// Offset of the data header (after PageHeader).
const DATA_HEADER_OFFSET: usize = PageHeader::SIZE;

/// Size of the data header in bytes.
const DATA_HEADER_SIZE: usize = 8;

/// Offset where the slot array begins.
const SLOTS_START: usize = DATA_HEADER_OFFSET + DATA_HEADER_SIZE;

/// Size of one slot entry.
const SLOT_SIZE: usize = 2;

/// Data page header extension.
///
/// Layout (8 bytes):
/// - slot_count: 2 bytes
/// - free_end: 2 bytes (start of tuple data)
/// - capacity: 2 bytes (target size in bytes, excluding the page header)
/// - reserved: 2 bytes
#[derive(Debug, Clone, Copy)]
struct DataPageHeader {
    slot_count: u16,
    free_end: u16,
    capacity: u16,
}

impl DataPageHeader {
    fn to_bytes(self) -> [u8; DATA_HEADER_SIZE] {
        let mut buf = [0u8; DATA_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.slot_count.to_le_bytes());
        buf[2..4].copy_from_slice(&self.free_end.to_le_bytes());
        buf[4..6].copy_from_slice(&self.capacity.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            slot_count: u16::from_le_bytes([buf[0], buf[1]]),
            free_end: u16::from_le_bytes([buf[2], buf[3]]),
            capacity: u16::from_le_bytes([buf[4], buf[5]]),
        }
    }
}

/// A leaf data page.
pub struct DataPage {
    page_id: PageId,
    data: Box<[u8; PAGE_SIZE]>,
}

impl DataPage {
    /// Creates an empty page whose usable size is `target_size` bytes,
    /// clamped to what a page can hold.
    pub fn create(page_id: PageId, target_size: usize) -> Self {
        let capacity = target_size.clamp(MIN_DATAPAGE_SIZE, MAX_DATAPAGE_SIZE);
        let mut data = Box::new([0u8; PAGE_SIZE]);

        let page_header = PageHeader::new(page_id, PageType::DataPage);
        data[..PageHeader::SIZE].copy_from_slice(&page_header.to_bytes());

        let header = DataPageHeader {
            slot_count: 0,
            free_end: (PageHeader::SIZE + capacity) as u16,
            capacity: capacity as u16,
        };
        data[DATA_HEADER_OFFSET..SLOTS_START].copy_from_slice(&header.to_bytes());

        Self { page_id, data }
    }

    /// Reads and validates a data page from the store.
    pub fn load(store: &dyn PageStore, xid: Xid, page_id: PageId) -> Result<Self> {
        let data = store.read_page(xid, page_id)?;
        Self::from_page(page_id, data)
    }

    /// Validates raw page bytes as a data page.
    pub fn from_page(page_id: PageId, data: Box<[u8; PAGE_SIZE]>) -> Result<Self> {
        let corrupted = |reason: String| StrataError::PageCorrupted {
            page_id: page_id.as_u64(),
            reason,
        };

        let page_header = PageHeader::from_bytes(&data[..PageHeader::SIZE]);
        if page_header.page_type != PageType::DataPage {
            return Err(corrupted(format!(
                "expected data page, found {:?}",
                page_header.page_type
            )));
        }

        let header = DataPageHeader::from_bytes(&data[DATA_HEADER_OFFSET..SLOTS_START]);
        let limit = PageHeader::SIZE + header.capacity as usize;
        let slots_end = SLOTS_START + header.slot_count as usize * SLOT_SIZE;
        if limit > PAGE_SIZE
            || (header.capacity as usize) < MIN_DATAPAGE_SIZE
            || slots_end > header.free_end as usize
            || header.free_end as usize > limit
        {
            return Err(corrupted(format!(
                "bad data header: {} slots, free end {}, capacity {}",
                header.slot_count, header.free_end, header.capacity
            )));
        }

        // Every slot must point at a complete tuple inside the data area.
        for i in 0..header.slot_count as usize {
            let pos = SLOTS_START + i * SLOT_SIZE;
            let offset = u16::from_le_bytes([data[pos], data[pos + 1]]) as usize;
            if offset < header.free_end as usize || offset + TupleHeader::SIZE > limit {
                return Err(corrupted(format!("slot {} offset {} out of range", i, offset)));
            }
            let tuple_header = TupleHeader::from_bytes(&data[offset..]);
            let end = offset
                + TupleHeader::SIZE
                + tuple_header.key_len as usize
                + tuple_header.value_len as usize;
            if end > limit {
                return Err(corrupted(format!("slot {} runs past the page", i)));
            }
        }

        Ok(Self { page_id, data })
    }

    fn header(&self) -> DataPageHeader {
        DataPageHeader::from_bytes(&self.data[DATA_HEADER_OFFSET..SLOTS_START])
    }

    fn set_header(&mut self, header: DataPageHeader) {
        self.data[DATA_HEADER_OFFSET..SLOTS_START].copy_from_slice(&header.to_bytes());
    }

    fn slot_offset(&self, idx: usize) -> usize {
        let pos = SLOTS_START + idx * SLOT_SIZE;
        u16::from_le_bytes([self.data[pos], self.data[pos + 1]]) as usize
    }

    /// Returns the page id.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Number of tuples on the page.
    pub fn len(&self) -> usize {
        self.header().slot_count as usize
    }

    /// Returns true if the page holds no tuples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Usable bytes after the page header.
    pub fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    /// Bytes left between the slot array and the tuple data.
    pub fn free_space(&self) -> usize {
        let header = self.header();
        let slots_end = SLOTS_START + header.slot_count as usize * SLOT_SIZE;
        header.free_end as usize - slots_end
    }

    /// Largest tuple an empty page of this capacity accepts.
    pub fn max_tuple_size(&self) -> usize {
        self.capacity() - DATA_HEADER_SIZE - SLOT_SIZE
    }

    /// Largest tuple a page created with `target_size` accepts.
    pub fn max_tuple_size_for(target_size: usize) -> usize {
        target_size.clamp(MIN_DATAPAGE_SIZE, MAX_DATAPAGE_SIZE) - DATA_HEADER_SIZE - SLOT_SIZE
    }

    /// Returns true once the page has been finalized.
    pub fn is_finalized(&self) -> bool {
        PageHeader::from_bytes(&self.data[..PageHeader::SIZE])
            .flags
            .is_finalized()
    }

    /// Appends a tuple. Returns false if the page has no room for it.
    ///
    /// Fails if the tuple could never fit an empty page, if its key sorts
    /// before the page's last key, or if the page is finalized.
    pub fn append(&mut self, tuple: &DataTuple) -> Result<bool> {
        if self.is_finalized() {
            return Err(StrataError::WritesDone);
        }

        let size = tuple.encoded_size();
        if !tuple.is_encodable() || size > self.max_tuple_size() {
            return Err(StrataError::TupleTooLarge {
                size,
                capacity: self.max_tuple_size(),
            });
        }

        if let Some(last) = self.last_key()
            && tuple.key().as_ref() < last
        {
            return Err(StrataError::KeysNotSorted {
                previous: last.to_vec(),
                next: tuple.key().to_vec(),
            });
        }

        if size + SLOT_SIZE > self.free_space() {
            return Ok(false);
        }

        let mut header = self.header();
        let offset = header.free_end as usize - size;
        tuple.encode_into(&mut self.data[offset..offset + size]);

        let slot_pos = SLOTS_START + header.slot_count as usize * SLOT_SIZE;
        self.data[slot_pos..slot_pos + SLOT_SIZE].copy_from_slice(&(offset as u16).to_le_bytes());

        header.slot_count += 1;
        header.free_end = offset as u16;
        self.set_header(header);
        Ok(true)
    }

    /// Key bytes of the tuple in slot `idx`.
    pub fn key_at(&self, idx: usize) -> &[u8] {
        let offset = self.slot_offset(idx);
        let header = TupleHeader::from_bytes(&self.data[offset..]);
        let start = offset + TupleHeader::SIZE;
        &self.data[start..start + header.key_len as usize]
    }

    /// Decodes the tuple in slot `idx`.
    pub fn get(&self, idx: usize) -> Result<DataTuple> {
        if idx >= self.len() {
            return Err(StrataError::Internal(format!(
                "slot {} out of range on page {}",
                idx, self.page_id
            )));
        }
        let offset = self.slot_offset(idx);
        DataTuple::decode(&self.data[offset..])
            .map(|(tuple, _)| tuple)
            .ok_or_else(|| StrataError::PageCorrupted {
                page_id: self.page_id.as_u64(),
                reason: format!("undecodable tuple in slot {}", idx),
            })
    }

    /// Smallest key on the page.
    pub fn first_key(&self) -> Option<Bytes> {
        (!self.is_empty()).then(|| Bytes::copy_from_slice(self.key_at(0)))
    }

    /// Largest key on the page.
    pub fn last_key(&self) -> Option<&[u8]> {
        let len = self.len();
        (len > 0).then(|| self.key_at(len - 1))
    }

    /// Index of the first tuple whose key is >= `key`.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        let mut lo = 0;
        let mut hi = self.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key_at(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Returns the first tuple whose key equals `key`.
    pub fn find(&self, key: &[u8]) -> Result<Option<DataTuple>> {
        let idx = self.lower_bound(key);
        if idx < self.len() && self.key_at(idx) == key {
            self.get(idx).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Iterates over all tuples in key order.
    pub fn iter(&self) -> DataPageIter<'_> {
        DataPageIter { page: self, idx: 0 }
    }

    /// Marks the page immutable and writes it to the store.
    pub fn finalize(&mut self, store: &dyn PageStore, xid: Xid) -> Result<()> {
        let mut page_header = PageHeader::from_bytes(&self.data[..PageHeader::SIZE]);
        page_header.flags.set_finalized(true);
        self.data[..PageHeader::SIZE].copy_from_slice(&page_header.to_bytes());
        store.write_page(xid, self.page_id, &self.data)
    }

    /// Total encoded bytes of the stored tuples.
    pub fn payload_bytes(&self) -> usize {
        let header = self.header();
        PageHeader::SIZE + header.capacity as usize - header.free_end as usize
    }
}

impl std::fmt::Debug for DataPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPage")
            .field("page_id", &self.page_id)
            .field("tuples", &self.len())
            .field("capacity", &self.capacity())
            .field("free_space", &self.free_space())
            .finish()
    }
}

/// Iterator over the tuples of a data page.
pub struct DataPageIter<'a> {
    page: &'a DataPage,
    idx: usize,
}

impl Iterator for DataPageIter<'_> {
    type Item = Result<DataTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.page.len() {
            return None;
        }
        let tuple = self.page.get(self.idx);
        self.idx += 1;
        Some(tuple)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.page.len().saturating_sub(self.idx);
        (remaining, Some(remaining))
    }
}
