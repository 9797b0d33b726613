//! Configuration structures for Strata.

use crate::error::{Result, StrataError};
use crate::page::{PageHeader, PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest accepted leaf data page target size in bytes.
pub const MIN_DATAPAGE_SIZE: usize = 64;

/// Largest accepted leaf data page target size in bytes.
pub const MAX_DATAPAGE_SIZE: usize = PAGE_SIZE - PageHeader::SIZE;

/// Configuration for the file-backed page store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the page file.
    pub data_dir: PathBuf,
    /// Name of the page file inside `data_dir`.
    pub file_name: String,
    /// Call fsync when a force is requested.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            file_name: "strata.pages".to_string(),
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the full path of the page file.
    pub fn page_file_path(&self) -> PathBuf {
        self.data_dir.join(&self.file_name)
    }
}

/// Build parameters for one sorted run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Pages per extent of the index-node region.
    pub internal_region_pages: u64,
    /// Pages per extent of the leaf data page region.
    pub datapage_region_pages: u64,
    /// Target size of a leaf data page in bytes.
    pub datapage_size: usize,
    /// Maximum entries per index node (0 = limited by page space only).
    pub index_fanout: usize,
    /// Expected number of keys for the bloom filter (0 = no filter).
    pub bloom_filter_size: u64,
    /// Target false positive rate of the bloom filter.
    pub bloom_fp_rate: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            internal_region_pages: 1000,
            datapage_region_pages: 10_000,
            datapage_size: MAX_DATAPAGE_SIZE,
            index_fanout: 0,
            bloom_filter_size: 0,
            bloom_fp_rate: 0.01,
        }
    }
}

impl RunConfig {
    /// Checks every parameter, returning the first offending one.
    pub fn validate(&self) -> Result<()> {
        if self.internal_region_pages < 2 {
            return Err(invalid("internal_region_pages", self.internal_region_pages));
        }
        if self.datapage_region_pages < 2 {
            return Err(invalid("datapage_region_pages", self.datapage_region_pages));
        }
        if !(MIN_DATAPAGE_SIZE..=MAX_DATAPAGE_SIZE).contains(&self.datapage_size) {
            return Err(StrataError::ConfigError(format!(
                "datapage_size must be within {}..={} bytes, got {}",
                MIN_DATAPAGE_SIZE, MAX_DATAPAGE_SIZE, self.datapage_size
            )));
        }
        if self.index_fanout == 1 {
            return Err(invalid("index_fanout", self.index_fanout));
        }
        if !(self.bloom_fp_rate > 0.0 && self.bloom_fp_rate < 1.0) {
            return Err(invalid("bloom_fp_rate", self.bloom_fp_rate));
        }
        Ok(())
    }

    /// Returns true if a bloom filter should be built.
    pub fn bloom_enabled(&self) -> bool {
        self.bloom_filter_size > 0
    }
}

fn invalid(name: &str, value: impl std::fmt::Display) -> StrataError {
    StrataError::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}
