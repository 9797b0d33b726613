//! File-backed page store.
//!
//! All pages live in one file. Page `n` sits at byte offset `n * PAGE_SIZE`;
//! page 0 is the superblock recording the next unused page number, the live
//! regions and the freed extents.

use crate::store::{check_page, seal_page, PageStore, RegionTable};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use strata_common::page::{PageHeader, PageId, PageType, PAGE_SIZE};
use strata_common::{Extent, Result, StorageConfig, StrataError, Xid};
use tracing::{debug, info};

/// Magic number identifying a Strata page file.
const SUPERBLOCK_MAGIC: u64 = 0x5354_5241_5441_5047;

/// Superblock format version.
const SUPERBLOCK_VERSION: u32 = 1;

/// Bytes of fixed superblock fields after the page header.
const SUPERBLOCK_FIXED: usize = 32;

/// Bytes per persisted extent (start, len).
const EXTENT_ENTRY_SIZE: usize = 16;

/// Maximum number of extents (live plus free) the superblock can hold.
const MAX_SUPERBLOCK_EXTENTS: usize =
    (PAGE_SIZE - PageHeader::SIZE - SUPERBLOCK_FIXED) / EXTENT_ENTRY_SIZE;

/// Page store backed by a single file.
pub struct FilePageStore {
    /// Configuration.
    config: StorageConfig,
    /// Open page file.
    file: Mutex<File>,
    /// Region bookkeeping mirrored in the superblock.
    table: Mutex<RegionTable>,
}

impl FilePageStore {
    /// Opens the page file named by `config`, creating it if absent.
    pub fn open(config: StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let path = config.page_file_path();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let table = if file_size == 0 {
            let table = RegionTable::new(1);
            write_superblock(&mut file, &table)?;
            info!(path = %path.display(), "created page file");
            table
        } else {
            let table = read_superblock(&mut file)?;
            info!(
                path = %path.display(),
                next_page = table.next_page,
                regions = table.regions.len(),
                "opened page file"
            );
            table
        };

        Ok(Self {
            config,
            file: Mutex::new(file),
            table: Mutex::new(table),
        })
    }

    /// Returns the page file path.
    pub fn path(&self) -> std::path::PathBuf {
        self.config.page_file_path()
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    fn ensure_live(&self, page_id: PageId) -> Result<()> {
        if self.table.lock().is_live(page_id) {
            Ok(())
        } else {
            Err(StrataError::PageNotFound {
                page_id: page_id.as_u64(),
            })
        }
    }

    fn persist_table(&self, table: &RegionTable) -> Result<()> {
        let mut file = self.file.lock();
        write_superblock(&mut file, table)
    }
}

impl PageStore for FilePageStore {
    fn alloc_region(&self, _xid: Xid, page_count: u64) -> Result<PageId> {
        let mut table = self.table.lock();
        // Commit to memory only once the superblock accepted the change.
        let mut next = table.clone();
        let start = next.reserve(page_count, None)?;
        self.persist_table(&next)?;
        *table = next;
        debug!(start = %start, pages = page_count, "allocated region");
        Ok(start)
    }

    fn free_region(&self, _xid: Xid, start: PageId) -> Result<()> {
        let mut table = self.table.lock();
        let mut next = table.clone();
        let extent = next.release(start)?;
        self.persist_table(&next)?;
        *table = next;
        debug!(start = %extent.start, pages = extent.len, "freed region");
        Ok(())
    }

    fn read_page(&self, _xid: Xid, page_id: PageId) -> Result<Box<[u8; PAGE_SIZE]>> {
        self.ensure_live(page_id)?;

        let mut file = self.file.lock();
        let offset = page_id.as_u64() * PAGE_SIZE as u64;
        let mut buffer = Box::new([0u8; PAGE_SIZE]);

        // Pages past the end of the file were allocated but never written.
        if offset + PAGE_SIZE as u64 <= file.metadata()?.len() {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buffer[..])?;
            check_page(page_id, &buffer)?;
        }

        Ok(buffer)
    }

    fn write_page(&self, xid: Xid, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        self.ensure_live(page_id)?;

        let page = seal_page(xid, page_id, data);
        let mut file = self.file.lock();
        let offset = page_id.as_u64() * PAGE_SIZE as u64;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&page[..])?;
        Ok(())
    }

    fn force(&self, xid: Xid) -> Result<()> {
        let table = self.table.lock();
        let mut file = self.file.lock();
        write_superblock(&mut file, &table)?;
        if self.config.fsync_enabled {
            file.sync_all()?;
        }
        debug!(%xid, "forced page file");
        Ok(())
    }

    fn live_regions(&self) -> Vec<Extent> {
        self.table.lock().live()
    }
}

impl Drop for FilePageStore {
    fn drop(&mut self) {
        let file = self.file.lock();
        let _ = file.sync_all();
    }
}

/// Superblock layout after the page header:
/// - magic: 8 bytes
/// - version: 4 bytes
/// - region_count: 4 bytes
/// - free_count: 4 bytes
/// - reserved: 4 bytes
/// - next_page: 8 bytes
/// - region_count + free_count extents of (start: 8, len: 8)
fn write_superblock(file: &mut File, table: &RegionTable) -> Result<()> {
    let total = table.regions.len() + table.free_extents.len();
    if total > MAX_SUPERBLOCK_EXTENTS {
        return Err(StrataError::RegionExhausted(format!(
            "superblock holds at most {} extents, {} needed",
            MAX_SUPERBLOCK_EXTENTS, total
        )));
    }

    let mut page = [0u8; PAGE_SIZE];
    let header = PageHeader::new(PageId::new(0), PageType::StoreHeader);
    page[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());

    let mut pos = PageHeader::SIZE;
    page[pos..pos + 8].copy_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
    page[pos + 8..pos + 12].copy_from_slice(&SUPERBLOCK_VERSION.to_le_bytes());
    page[pos + 12..pos + 16].copy_from_slice(&(table.regions.len() as u32).to_le_bytes());
    page[pos + 16..pos + 20].copy_from_slice(&(table.free_extents.len() as u32).to_le_bytes());
    page[pos + 24..pos + 32].copy_from_slice(&table.next_page.to_le_bytes());
    pos += SUPERBLOCK_FIXED;

    let extents = table
        .regions
        .iter()
        .map(|(&start, &len)| (start, len))
        .chain(
            table
                .free_extents
                .iter()
                .map(|extent| (extent.start.as_u64(), extent.len)),
        );
    for (start, len) in extents {
        page[pos..pos + 8].copy_from_slice(&start.to_le_bytes());
        page[pos + 8..pos + 16].copy_from_slice(&len.to_le_bytes());
        pos += EXTENT_ENTRY_SIZE;
    }

    let page = seal_page(Xid::default(), PageId::new(0), &page);
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&page[..])?;
    Ok(())
}

fn read_superblock(file: &mut File) -> Result<RegionTable> {
    let mut page = Box::new([0u8; PAGE_SIZE]);
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut page[..])?;
    check_page(PageId::new(0), &page)?;

    let corrupted = |reason: &str| StrataError::PageCorrupted {
        page_id: 0,
        reason: reason.to_string(),
    };

    let header = PageHeader::from_bytes(&page[..PageHeader::SIZE]);
    if header.page_type != PageType::StoreHeader {
        return Err(corrupted("not a superblock"));
    }

    let pos = PageHeader::SIZE;
    let magic = read_u64(&page[..], pos);
    if magic != SUPERBLOCK_MAGIC {
        return Err(corrupted("bad magic"));
    }
    let version = read_u32(&page[..], pos + 8);
    if version != SUPERBLOCK_VERSION {
        return Err(corrupted("unsupported version"));
    }
    let region_count = read_u32(&page[..], pos + 12) as usize;
    let free_count = read_u32(&page[..], pos + 16) as usize;
    if region_count + free_count > MAX_SUPERBLOCK_EXTENTS {
        return Err(corrupted("extent count out of range"));
    }

    let mut table = RegionTable::new(read_u64(&page[..], pos + 24));
    let mut entry = pos + SUPERBLOCK_FIXED;
    for i in 0..region_count + free_count {
        let start = read_u64(&page[..], entry);
        let len = read_u64(&page[..], entry + 8);
        if i < region_count {
            table.regions.insert(start, len);
        } else {
            table.free_extents.push(Extent::new(PageId::new(start), len));
        }
        entry += EXTENT_ENTRY_SIZE;
    }
    Ok(table)
}

fn read_u64(buf: &[u8], pos: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[pos..pos + 8]);
    u64::from_le_bytes(bytes)
}

fn read_u32(buf: &[u8], pos: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[pos..pos + 4]);
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const XID: Xid = Xid(3);

    fn create_test_store() -> (FilePageStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            ..Default::default()
        };
        let store = FilePageStore::open(config).unwrap();
        (store, dir)
    }

    fn data_page(marker: u8) -> [u8; PAGE_SIZE] {
        let mut data = [0u8; PAGE_SIZE];
        let header = PageHeader::new(PageId::INVALID, PageType::DataPage);
        data[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());
        data[PageHeader::SIZE] = marker;
        data[PAGE_SIZE - 1] = marker;
        data
    }

    #[test]
    fn test_open_creates_file() {
        let (store, _dir) = create_test_store();
        assert!(store.path().exists());
        assert!(store.data_dir().exists());
        assert!(store.live_regions().is_empty());
    }

    #[test]
    fn test_alloc_region_skips_superblock() {
        let (store, _dir) = create_test_store();
        let a = store.alloc_region(XID, 4).unwrap();
        let b = store.alloc_region(XID, 2).unwrap();
        assert_eq!(a, PageId::new(1));
        assert_eq!(b, PageId::new(5));
    }

    #[test]
    fn test_write_read() {
        let (store, _dir) = create_test_store();
        let start = store.alloc_region(XID, 3).unwrap();

        store.write_page(XID, start.offset(1), &data_page(0xCD)).unwrap();
        let read = store.read_page(XID, start.offset(1)).unwrap();
        assert_eq!(read[PageHeader::SIZE], 0xCD);
        assert_eq!(read[PAGE_SIZE - 1], 0xCD);

        let header = PageHeader::from_bytes(&read[..PageHeader::SIZE]);
        assert_eq!(header.page_id, start.offset(1));
        assert_eq!(header.xid, XID.0);
    }

    #[test]
    fn test_unwritten_page_reads_zeroed() {
        let (store, _dir) = create_test_store();
        let start = store.alloc_region(XID, 8).unwrap();
        let read = store.read_page(XID, start.offset(7)).unwrap();
        assert!(read.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_outside_region() {
        let (store, _dir) = create_test_store();
        store.alloc_region(XID, 1).unwrap();
        assert!(matches!(
            store.read_page(XID, PageId::new(99)),
            Err(StrataError::PageNotFound { page_id: 99 })
        ));
        assert!(store.read_page(XID, PageId::new(0)).is_err());
    }

    #[test]
    fn test_overwrite_page() {
        let (store, _dir) = create_test_store();
        let start = store.alloc_region(XID, 1).unwrap();

        store.write_page(XID, start, &data_page(0xAA)).unwrap();
        store.write_page(XID, start, &data_page(0xBB)).unwrap();

        assert_eq!(store.read_page(XID, start).unwrap()[PageHeader::SIZE], 0xBB);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: true,
            ..Default::default()
        };

        let (kept, freed) = {
            let store = FilePageStore::open(config.clone()).unwrap();
            let kept = store.alloc_region(XID, 4).unwrap();
            let freed = store.alloc_region(XID, 2).unwrap();
            store.write_page(XID, kept.offset(3), &data_page(0xFF)).unwrap();
            store.free_region(XID, freed).unwrap();
            store.force(XID).unwrap();
            (kept, freed)
        };

        let store = FilePageStore::open(config).unwrap();
        assert_eq!(store.live_regions(), vec![Extent::new(kept, 4)]);
        assert_eq!(store.read_page(XID, kept.offset(3)).unwrap()[PageHeader::SIZE], 0xFF);

        // The freed extent survives the reopen and is reused.
        assert_eq!(store.alloc_region(XID, 2).unwrap(), freed);
    }

    #[test]
    fn test_corrupted_page_detected() {
        let (store, _dir) = create_test_store();
        let start = store.alloc_region(XID, 1).unwrap();
        store.write_page(XID, start, &data_page(1)).unwrap();

        {
            let mut file = store.file.lock();
            let offset = start.as_u64() * PAGE_SIZE as u64 + 500;
            file.seek(SeekFrom::Start(offset)).unwrap();
            file.write_all(&[0x5A]).unwrap();
        }

        assert!(matches!(
            store.read_page(XID, start),
            Err(StrataError::PageCorrupted { .. })
        ));
    }

    #[test]
    fn test_bad_superblock_rejected() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            ..Default::default()
        };
        std::fs::create_dir_all(&config.data_dir).unwrap();
        std::fs::write(config.page_file_path(), vec![0xEEu8; PAGE_SIZE]).unwrap();

        assert!(matches!(
            FilePageStore::open(config),
            Err(StrataError::PageCorrupted { page_id: 0, .. })
        ));
    }
}
