//! Transaction ids, record locators and page extents.

use crate::page::{PageHeader, PageId, PAGE_SIZE};
use serde::{Deserialize, Serialize};

/// Transaction id supplied by the caller for every page-store operation.
///
/// The storage layer does not interpret it beyond stamping it into the pages
/// it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Xid(pub u64);

impl std::fmt::Display for Xid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "xid:{}", self.0)
    }
}

/// Locator of a small record stored inside a page.
///
/// `slot` is the byte offset of the record measured from the end of the page
/// header, `size` its length in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    /// Page holding the record.
    pub page: PageId,
    /// Byte offset after the page header.
    pub slot: u16,
    /// Record length in bytes.
    pub size: u16,
}

impl RecordId {
    /// Encoded size of a locator in bytes.
    pub const ENCODED_SIZE: usize = 12;

    /// Creates a new record locator.
    pub fn new(page: PageId, slot: u16, size: u16) -> Self {
        Self { page, slot, size }
    }

    /// Byte range of the record within its page, or None if it would run
    /// past the end of the page.
    pub fn byte_range(&self) -> Option<std::ops::Range<usize>> {
        let start = PageHeader::SIZE + self.slot as usize;
        let end = start + self.size as usize;
        (end <= PAGE_SIZE).then_some(start..end)
    }

    /// Serializes the locator to bytes.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        buf[0..8].copy_from_slice(&self.page.as_u64().to_le_bytes());
        buf[8..10].copy_from_slice(&self.slot.to_le_bytes());
        buf[10..12].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Deserializes a locator from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            page: PageId::from_u64(u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ])),
            slot: u16::from_le_bytes([buf[8], buf[9]]),
            size: u16::from_le_bytes([buf[10], buf[11]]),
        }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}+{}", self.page, self.slot, self.size)
    }
}

/// A contiguous run of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    /// First page of the run.
    pub start: PageId,
    /// Number of pages.
    pub len: u64,
}

impl Extent {
    /// Creates a new extent.
    pub fn new(start: PageId, len: u64) -> Self {
        Self { start, len }
    }

    /// Returns true if the page falls inside this extent.
    pub fn contains(&self, page_id: PageId) -> bool {
        page_id >= self.start && page_id.as_u64() < self.start.as_u64() + self.len
    }

    /// First page after the extent.
    pub fn end(&self) -> PageId {
        self.start.offset(self.len)
    }
}
