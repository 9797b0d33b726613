//! Page store interface and the in-memory page arena.
//!
//! A page store hands out contiguous regions of page ids, reads and writes
//! whole pages inside live regions, and persists small locator records. It is
//! the only path by which the index and data pages reach storage.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::page::{stamp_checksum, verify_checksum, PageHeader, PageId, PAGE_SIZE};
use strata_common::{Extent, RecordId, Result, StrataError, Xid};

/// Storage backend for pages and regions.
pub trait PageStore: Send + Sync {
    /// Reserves `page_count` contiguous pages and returns the first one.
    fn alloc_region(&self, xid: Xid, page_count: u64) -> Result<PageId>;

    /// Releases the region starting at `start`. Its pages become unreadable.
    fn free_region(&self, xid: Xid, start: PageId) -> Result<()>;

    /// Reads a page. Pages never written read back zeroed.
    fn read_page(&self, xid: Xid, page_id: PageId) -> Result<Box<[u8; PAGE_SIZE]>>;

    /// Writes a page. The store stamps page id, xid and checksum.
    fn write_page(&self, xid: Xid, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()>;

    /// Makes every completed write durable.
    fn force(&self, xid: Xid) -> Result<()>;

    /// Returns all live regions in page order.
    fn live_regions(&self) -> Vec<Extent>;

    /// Reads the record named by `rid`.
    fn read_record(&self, xid: Xid, rid: RecordId) -> Result<Vec<u8>> {
        let range = rid.byte_range().ok_or_else(|| locator_error(rid, "record past end of page"))?;
        let page = self.read_page(xid, rid.page)?;
        Ok(page[range].to_vec())
    }

    /// Overwrites the record named by `rid`. `bytes` must match its size.
    fn write_record(&self, xid: Xid, rid: RecordId, bytes: &[u8]) -> Result<()> {
        if bytes.len() != rid.size as usize {
            return Err(locator_error(rid, "record size mismatch"));
        }
        let range = rid.byte_range().ok_or_else(|| locator_error(rid, "record past end of page"))?;
        let mut page = self.read_page(xid, rid.page)?;
        page[range].copy_from_slice(bytes);
        self.write_page(xid, rid.page, &page)
    }
}

fn locator_error(rid: RecordId, reason: &str) -> StrataError {
    StrataError::InvalidLocator {
        page_id: rid.page.as_u64(),
        slot: rid.slot,
        size: rid.size,
        reason: reason.to_string(),
    }
}

/// Copies a page for storage, stamping its identity and checksum.
pub(crate) fn seal_page(xid: Xid, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Box<[u8; PAGE_SIZE]> {
    let mut page = Box::new(*data);
    let mut header = PageHeader::from_bytes(&page[..PageHeader::SIZE]);
    header.page_id = page_id;
    header.xid = xid.0;
    page[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());
    stamp_checksum(&mut page);
    page
}

/// Verifies a page read back from storage.
pub(crate) fn check_page(page_id: PageId, page: &[u8; PAGE_SIZE]) -> Result<()> {
    if !verify_checksum(page) {
        return Err(StrataError::PageCorrupted {
            page_id: page_id.as_u64(),
            reason: "checksum mismatch".to_string(),
        });
    }
    let header = PageHeader::from_bytes(&page[..PageHeader::SIZE]);
    if header.page_type != strata_common::PageType::Free && header.page_id != page_id {
        return Err(StrataError::PageCorrupted {
            page_id: page_id.as_u64(),
            reason: format!("page header names page {}", header.page_id),
        });
    }
    Ok(())
}

/// Region bookkeeping shared by the page store implementations.
#[derive(Debug, Clone, Default)]
pub(crate) struct RegionTable {
    /// Live regions keyed by first page number.
    pub(crate) regions: BTreeMap<u64, u64>,
    /// Freed extents available for reuse.
    pub(crate) free_extents: Vec<Extent>,
    /// First page number never handed out.
    pub(crate) next_page: u64,
}

impl RegionTable {
    /// Creates a table whose first allocation starts at `first_page`.
    pub(crate) fn new(first_page: u64) -> Self {
        Self {
            regions: BTreeMap::new(),
            free_extents: Vec::new(),
            next_page: first_page,
        }
    }

    /// Returns true if the page lies inside a live region.
    pub(crate) fn is_live(&self, page_id: PageId) -> bool {
        let page_num = page_id.as_u64();
        self.regions
            .range(..=page_num)
            .next_back()
            .is_some_and(|(&start, &len)| page_num < start + len)
    }

    /// Reserves a region, reusing a freed extent when one is large enough.
    pub(crate) fn reserve(&mut self, page_count: u64, limit: Option<u64>) -> Result<PageId> {
        if page_count == 0 {
            return Err(StrataError::InvalidParameter {
                name: "page_count".to_string(),
                value: "0".to_string(),
            });
        }

        let reusable = self
            .free_extents
            .iter()
            .position(|extent| extent.len >= page_count);

        let start = if let Some(idx) = reusable {
            let extent = self.free_extents[idx];
            if extent.len == page_count {
                self.free_extents.swap_remove(idx);
            } else {
                self.free_extents[idx] =
                    Extent::new(extent.start.offset(page_count), extent.len - page_count);
            }
            extent.start.as_u64()
        } else {
            let start = self.next_page;
            if let Some(limit) = limit
                && start + page_count > limit
            {
                return Err(StrataError::RegionExhausted(format!(
                    "store limited to {} pages, {} requested at page {}",
                    limit, page_count, start
                )));
            }
            self.next_page = start + page_count;
            start
        };

        self.regions.insert(start, page_count);
        Ok(PageId::new(start))
    }

    /// Releases a region and returns its extent.
    pub(crate) fn release(&mut self, start: PageId) -> Result<Extent> {
        let len = self
            .regions
            .remove(&start.as_u64())
            .ok_or(StrataError::RegionNotFound {
                start: start.as_u64(),
            })?;
        let extent = Extent::new(start, len);
        self.free_extents.push(extent);
        Ok(extent)
    }

    /// Live regions in page order.
    pub(crate) fn live(&self) -> Vec<Extent> {
        self.regions
            .iter()
            .map(|(&start, &len)| Extent::new(PageId::new(start), len))
            .collect()
    }
}

/// In-memory page store.
///
/// Pages are kept in a hash map keyed by page id; regions are tracked in a
/// [`RegionTable`]. Forcing is a no-op apart from bumping a counter.
pub struct MemPageStore {
    inner: RwLock<MemInner>,
    /// Optional upper bound on page numbers, to exercise out-of-space paths.
    limit: Option<u64>,
    forces: AtomicU64,
}

struct MemInner {
    pages: HashMap<PageId, Box<[u8; PAGE_SIZE]>>,
    table: RegionTable,
}

impl MemPageStore {
    /// Creates a new empty page store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemInner {
                pages: HashMap::new(),
                // Page 0 stays reserved, matching the file store's superblock.
                table: RegionTable::new(1),
            }),
            limit: None,
            forces: AtomicU64::new(0),
        }
    }

    /// Creates a store that refuses to grow past `max_pages` page numbers.
    pub fn with_capacity(max_pages: u64) -> Self {
        Self {
            limit: Some(max_pages),
            ..Self::new()
        }
    }

    /// Number of pages currently materialized.
    pub fn resident_pages(&self) -> usize {
        self.inner.read().pages.len()
    }

    /// Number of times `force` has been called.
    pub fn force_count(&self) -> u64 {
        self.forces.load(Ordering::Relaxed)
    }

    /// Overwrites raw page bytes without sealing them, bypassing checksums.
    #[cfg(test)]
    pub(crate) fn corrupt_page(&self, page_id: PageId, offset: usize) {
        if let Some(page) = self.inner.write().pages.get_mut(&page_id) {
            page[offset] ^= 0xFF;
        }
    }
}

impl Default for MemPageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStore for MemPageStore {
    fn alloc_region(&self, _xid: Xid, page_count: u64) -> Result<PageId> {
        self.inner.write().table.reserve(page_count, self.limit)
    }

    fn free_region(&self, _xid: Xid, start: PageId) -> Result<()> {
        let mut inner = self.inner.write();
        let extent = inner.table.release(start)?;
        inner.pages.retain(|page_id, _| !extent.contains(*page_id));
        Ok(())
    }

    fn read_page(&self, _xid: Xid, page_id: PageId) -> Result<Box<[u8; PAGE_SIZE]>> {
        let inner = self.inner.read();
        if !inner.table.is_live(page_id) {
            return Err(StrataError::PageNotFound {
                page_id: page_id.as_u64(),
            });
        }
        match inner.pages.get(&page_id) {
            Some(page) => {
                check_page(page_id, page)?;
                Ok(page.clone())
            }
            None => Ok(Box::new([0u8; PAGE_SIZE])),
        }
    }

    fn write_page(&self, xid: Xid, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.table.is_live(page_id) {
            return Err(StrataError::PageNotFound {
                page_id: page_id.as_u64(),
            });
        }
        inner.pages.insert(page_id, seal_page(xid, page_id, data));
        Ok(())
    }

    fn force(&self, _xid: Xid) -> Result<()> {
        self.forces.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn live_regions(&self) -> Vec<Extent> {
        self.inner.read().table.live()
    }
}
