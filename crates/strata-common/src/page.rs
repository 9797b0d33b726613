//! Page structures for Strata storage.

use serde::{Deserialize, Serialize};

/// Default page size in bytes (16 KB).
pub const PAGE_SIZE: usize = 16 * 1024;

/// Unique identifier for a page within a page store.
///
/// Page ids form a single flat address space; regions are contiguous runs of
/// ids handed out by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(u64);

impl PageId {
    /// Sentinel for "no page".
    pub const INVALID: PageId = PageId(u64::MAX);

    /// Creates a new PageId.
    pub const fn new(page_num: u64) -> Self {
        Self(page_num)
    }

    /// Returns the PageId as a u64 for compact storage.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Creates a PageId from a u64 representation.
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Returns true unless this is the invalid sentinel.
    pub const fn is_valid(&self) -> bool {
        self.0 != u64::MAX
    }

    /// Returns the page `n` pages after this one.
    pub const fn offset(&self, n: u64) -> Self {
        Self(self.0 + n)
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "invalid")
        }
    }
}

/// Page types in Strata storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageType {
    /// Unallocated or never written page.
    Free = 0,
    /// Page store superblock.
    StoreHeader = 1,
    /// Region allocator state page.
    RegionHeader = 2,
    /// Index tree node.
    IndexNode = 3,
    /// Leaf data page holding sorted tuples.
    DataPage = 4,
}

impl PageType {
    /// Decodes a page type byte. Unknown values map to None.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PageType::Free),
            1 => Some(PageType::StoreHeader),
            2 => Some(PageType::RegionHeader),
            3 => Some(PageType::IndexNode),
            4 => Some(PageType::DataPage),
            _ => None,
        }
    }
}

/// Header structure at the beginning of every page.
///
/// Layout (32 bytes total):
/// - page_id: 8 bytes
/// - xid: 8 bytes (transaction that last wrote the page)
/// - page_type: 1 byte
/// - flags: 1 byte
/// - reserved: 2 bytes
/// - checksum: 4 bytes (CRC32 of the page with this field zeroed)
/// - reserved: 8 bytes
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageHeader {
    /// Page identifier.
    pub page_id: PageId,
    /// Transaction that last wrote this page.
    pub xid: u64,
    /// Type of this page.
    pub page_type: PageType,
    /// Page flags.
    pub flags: PageFlags,
    /// CRC32 checksum of the page contents.
    pub checksum: u32,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 32;

    /// Byte range of the checksum field.
    const CHECKSUM_RANGE: std::ops::Range<usize> = 20..24;

    /// Creates a new page header.
    pub fn new(page_id: PageId, page_type: PageType) -> Self {
        Self {
            page_id,
            xid: 0,
            page_type,
            flags: PageFlags::empty(),
            checksum: 0,
        }
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.page_id.as_u64().to_le_bytes());
        buf[8..16].copy_from_slice(&self.xid.to_le_bytes());
        buf[16] = self.page_type as u8;
        buf[17] = self.flags.0;
        buf[20..24].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Deserializes the header from bytes. Unknown page types read as `Free`.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let page_id = PageId::from_u64(u64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ]));
        let xid = u64::from_le_bytes([
            buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
        ]);
        let page_type = PageType::from_u8(buf[16]).unwrap_or(PageType::Free);
        let flags = PageFlags(buf[17]);
        let checksum = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);

        Self {
            page_id,
            xid,
            page_type,
            flags,
            checksum,
        }
    }
}

/// Computes the checksum of a page, skipping the checksum field itself.
pub fn page_checksum(page: &[u8; PAGE_SIZE]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[..PageHeader::CHECKSUM_RANGE.start]);
    hasher.update(&page[PageHeader::CHECKSUM_RANGE.end..]);
    hasher.finalize()
}

/// Stamps the page's checksum field with its current checksum.
pub fn stamp_checksum(page: &mut [u8; PAGE_SIZE]) {
    let checksum = page_checksum(page);
    page[PageHeader::CHECKSUM_RANGE].copy_from_slice(&checksum.to_le_bytes());
}

/// Returns true if the stored checksum matches the page contents.
///
/// An all-zero page was never written and always verifies. Any other page
/// is checked, whatever its type byte says.
pub fn verify_checksum(page: &[u8; PAGE_SIZE]) -> bool {
    if page.iter().all(|&b| b == 0) {
        return true;
    }
    let header = PageHeader::from_bytes(&page[..PageHeader::SIZE]);
    header.checksum == page_checksum(page)
}

/// Flags for page state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PageFlags(u8);

impl PageFlags {
    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Page contents are final and will not be modified again.
    pub const FINALIZED: u8 = 0b0000_0001;

    /// Returns true if the finalized flag is set.
    pub fn is_finalized(&self) -> bool {
        self.0 & Self::FINALIZED != 0
    }

    /// Sets the finalized flag.
    pub fn set_finalized(&mut self, finalized: bool) {
        if finalized {
            self.0 |= Self::FINALIZED;
        } else {
            self.0 &= !Self::FINALIZED;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_constant() {
        assert_eq!(PAGE_SIZE, 16384);
    }

    #[test]
    fn test_page_id_roundtrip() {
        let page_id = PageId::new(1000);
        assert_eq!(page_id, PageId::from_u64(page_id.as_u64()));
        assert_eq!(page_id.offset(5), PageId::new(1005));
    }

    #[test]
    fn test_page_id_invalid() {
        assert!(!PageId::INVALID.is_valid());
        assert!(PageId::new(0).is_valid());
        assert_eq!(PageId::INVALID.to_string(), "invalid");
        assert_eq!(PageId::new(12).to_string(), "12");
    }

    #[test]
    fn test_page_id_ordering() {
        let mut ids = vec![PageId::new(9), PageId::new(2), PageId::new(5)];
        ids.sort();
        assert_eq!(ids, vec![PageId::new(2), PageId::new(5), PageId::new(9)]);
    }

    #[test]
    fn test_page_type_from_u8() {
        for page_type in [
            PageType::Free,
            PageType::StoreHeader,
            PageType::RegionHeader,
            PageType::IndexNode,
            PageType::DataPage,
        ] {
            assert_eq!(PageType::from_u8(page_type as u8), Some(page_type));
        }
        assert_eq!(PageType::from_u8(200), None);
    }

    #[test]
    fn test_page_header_roundtrip() {
        let mut header = PageHeader::new(PageId::new(77), PageType::IndexNode);
        header.xid = 12345;
        header.checksum = 0xDEADBEEF;
        header.flags.set_finalized(true);

        let decoded = PageHeader::from_bytes(&header.to_bytes());
        assert_eq!(decoded.page_id, PageId::new(77));
        assert_eq!(decoded.xid, 12345);
        assert_eq!(decoded.page_type, PageType::IndexNode);
        assert!(decoded.flags.is_finalized());
        assert_eq!(decoded.checksum, 0xDEADBEEF);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut page = [0u8; PAGE_SIZE];
        let header = PageHeader::new(PageId::new(3), PageType::DataPage);
        page[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());
        page[100] = 42;

        stamp_checksum(&mut page);
        assert!(verify_checksum(&page));

        page[200] ^= 0xFF;
        assert!(!verify_checksum(&page));
    }

    #[test]
    fn test_free_page_always_verifies() {
        let page = [0u8; PAGE_SIZE];
        assert!(verify_checksum(&page));
    }

    #[test]
    fn test_corrupted_type_byte_still_checked() {
        let mut page = [0u8; PAGE_SIZE];
        let header = PageHeader::new(PageId::new(9), PageType::IndexNode);
        page[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());
        page[64] = 7;
        stamp_checksum(&mut page);
        assert!(verify_checksum(&page));

        // An unknown type byte decodes as Free but the page is not blank.
        page[16] = 200;
        assert_eq!(
            PageHeader::from_bytes(&page[..PageHeader::SIZE]).page_type,
            PageType::Free
        );
        assert!(!verify_checksum(&page));
    }

    #[test]
    fn test_page_flags() {
        let mut flags = PageFlags::empty();
        assert!(!flags.is_finalized());
        flags.set_finalized(true);
        assert!(flags.is_finalized());
        flags.set_finalized(false);
        assert!(!flags.is_finalized());
        assert!(!PageFlags::default().is_finalized());
    }

    #[test]
    fn test_page_id_serde_roundtrip() {
        let original = PageId::new(500);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: PageId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }
}
