//! Region allocator.
//!
//! Hands out page ids from a chain of equally sized extents reserved from the
//! page store. The first page of the first extent is a region header page
//! holding the allocator state record, rewritten on every allocation so the
//! allocator can be reopened from its locator alone.

use crate::store::PageStore;
use std::sync::Arc;
use strata_common::page::{PageHeader, PageId, PageType, PAGE_SIZE};
use strata_common::{Extent, RecordId, Result, StrataError, Xid};
use tracing::debug;

/// Maximum number of extents one allocator may chain.
pub const MAX_REGION_EXTENTS: usize = 1024;

/// Fixed part of the state record: region_length, next_offset, extent_count.
const STATE_FIXED: usize = 24;

/// Size in bytes of the persisted state record.
pub const REGION_STATE_SIZE: usize = STATE_FIXED + MAX_REGION_EXTENTS * 8;

const _: () = assert!(PageHeader::SIZE + REGION_STATE_SIZE <= PAGE_SIZE);

/// Allocates pages from a growable region.
pub struct RegionAllocator {
    store: Arc<dyn PageStore>,
    /// Locator of the persisted state record.
    state_rid: RecordId,
    /// Pages per extent.
    region_length: u64,
    /// Next unused page offset inside the last extent.
    next_offset: u64,
    /// First page of every extent, in reservation order.
    extents: Vec<PageId>,
}

impl RegionAllocator {
    /// Reserves the first extent and writes the initial state record.
    pub fn create(store: Arc<dyn PageStore>, xid: Xid, region_length: u64) -> Result<Self> {
        if region_length < 2 {
            return Err(StrataError::InvalidParameter {
                name: "region_length".to_string(),
                value: region_length.to_string(),
            });
        }

        let start = store.alloc_region(xid, region_length)?;

        let mut page = [0u8; PAGE_SIZE];
        let header = PageHeader::new(start, PageType::RegionHeader);
        page[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());
        store.write_page(xid, start, &page)?;

        let allocator = Self {
            store,
            state_rid: RecordId::new(start, 0, REGION_STATE_SIZE as u16),
            region_length,
            // Offset 0 of the first extent is the header page.
            next_offset: 1,
            extents: vec![start],
        };
        allocator.persist(xid)?;
        Ok(allocator)
    }

    /// Reopens an allocator from its state record.
    pub fn open(store: Arc<dyn PageStore>, xid: Xid, state_rid: RecordId) -> Result<Self> {
        if state_rid.size as usize != REGION_STATE_SIZE || state_rid.slot != 0 {
            return Err(StrataError::InvalidLocator {
                page_id: state_rid.page.as_u64(),
                slot: state_rid.slot,
                size: state_rid.size,
                reason: "not a region state record".to_string(),
            });
        }

        let page = store.read_page(xid, state_rid.page)?;
        let header = PageHeader::from_bytes(&page[..PageHeader::SIZE]);
        if header.page_type != PageType::RegionHeader {
            return Err(StrataError::PageCorrupted {
                page_id: state_rid.page.as_u64(),
                reason: format!("expected region header, found {:?}", header.page_type),
            });
        }

        let record = store.read_record(xid, state_rid)?;
        let corrupted = |reason: String| StrataError::PageCorrupted {
            page_id: state_rid.page.as_u64(),
            reason,
        };

        let region_length = read_u64(&record, 0);
        let next_offset = read_u64(&record, 8);
        let extent_count = read_u64(&record, 16) as usize;
        if region_length < 2 || next_offset > region_length {
            return Err(corrupted(format!(
                "bad region state: length {}, next offset {}",
                region_length, next_offset
            )));
        }
        if extent_count == 0 || extent_count > MAX_REGION_EXTENTS {
            return Err(corrupted(format!("bad extent count {}", extent_count)));
        }

        let extents: Vec<PageId> = (0..extent_count)
            .map(|i| PageId::new(read_u64(&record, STATE_FIXED + i * 8)))
            .collect();
        if extents[0] != state_rid.page {
            return Err(corrupted("first extent does not hold the header".to_string()));
        }

        Ok(Self {
            store,
            state_rid,
            region_length,
            next_offset,
            extents,
        })
    }

    /// Returns the next unused page id, reserving a new extent when the
    /// current one is exhausted.
    pub fn alloc_page(&mut self, xid: Xid) -> Result<PageId> {
        if self.extents.is_empty() {
            return Err(StrataError::AlreadyDeallocated);
        }
        if self.next_offset == self.region_length {
            if self.extents.len() == MAX_REGION_EXTENTS {
                return Err(StrataError::RegionExhausted(format!(
                    "allocator at {} already chains {} extents",
                    self.state_rid.page, MAX_REGION_EXTENTS
                )));
            }
            let start = self.store.alloc_region(xid, self.region_length)?;
            debug!(
                header = %self.state_rid.page,
                start = %start,
                pages = self.region_length,
                "region grew by one extent"
            );
            self.extents.push(start);
            self.next_offset = 0;
        }

        let last = self.extents[self.extents.len() - 1];
        let page_id = last.offset(self.next_offset);
        self.next_offset += 1;
        self.persist(xid)?;
        Ok(page_id)
    }

    /// Locator of the persisted state record.
    pub fn state_rid(&self) -> RecordId {
        self.state_rid
    }

    /// Pages per extent.
    pub fn region_length(&self) -> u64 {
        self.region_length
    }

    /// Every extent reserved by this allocator.
    pub fn list_extents(&self) -> Vec<Extent> {
        self.extents
            .iter()
            .map(|&start| Extent::new(start, self.region_length))
            .collect()
    }

    /// Number of pages handed out, not counting the header page.
    pub fn pages_allocated(&self) -> u64 {
        if self.extents.is_empty() {
            return 0;
        }
        (self.extents.len() as u64 - 1) * self.region_length + self.next_offset - 1
    }

    /// Returns true if `page_id` was handed out by this allocator.
    pub fn owns(&self, page_id: PageId) -> bool {
        let Some(last) = self.extents.len().checked_sub(1) else {
            return false;
        };
        self.extents.iter().enumerate().any(|(i, &start)| {
            let used = if i == last {
                self.next_offset
            } else {
                self.region_length
            };
            Extent::new(start, used).contains(page_id) && page_id != self.state_rid.page
        })
    }

    /// Frees every extent. The allocator must not be used afterwards.
    pub fn dealloc(&mut self, xid: Xid) -> Result<()> {
        // Free newest first so the header page goes last.
        while let Some(&start) = self.extents.last() {
            self.store.free_region(xid, start)?;
            self.extents.pop();
        }
        Ok(())
    }

    fn persist(&self, xid: Xid) -> Result<()> {
        let mut record = vec![0u8; REGION_STATE_SIZE];
        record[0..8].copy_from_slice(&self.region_length.to_le_bytes());
        record[8..16].copy_from_slice(&self.next_offset.to_le_bytes());
        record[16..24].copy_from_slice(&(self.extents.len() as u64).to_le_bytes());
        for (i, start) in self.extents.iter().enumerate() {
            let pos = STATE_FIXED + i * 8;
            record[pos..pos + 8].copy_from_slice(&start.as_u64().to_le_bytes());
        }
        self.store.write_record(xid, self.state_rid, &record)
    }
}

impl std::fmt::Debug for RegionAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionAllocator")
            .field("state_rid", &self.state_rid)
            .field("region_length", &self.region_length)
            .field("next_offset", &self.next_offset)
            .field("extents", &self.extents)
            .finish()
    }
}

fn read_u64(buf: &[u8], pos: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[pos..pos + 8]);
    u64::from_le_bytes(bytes)
}
