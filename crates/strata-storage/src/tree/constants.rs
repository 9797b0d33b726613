//! Index tree constants.

use strata_common::page::PageHeader;

/// Maximum key size in bytes.
pub const MAX_KEY_SIZE: usize = 1024;

/// Maximum number of levels, root included.
pub const MAX_DEPTH: usize = 32;

/// Size of the node header after the page header.
/// Layout: num_entries (2), level (2), data_end (2), reserved (2).
pub(crate) const NODE_HEADER_SIZE: usize = 8;

/// Offset of the node header in the page.
pub(crate) const NODE_HEADER_OFFSET: usize = PageHeader::SIZE;

/// Offset where the slot array begins.
pub(crate) const SLOT_ARRAY_START: usize = NODE_HEADER_OFFSET + NODE_HEADER_SIZE;

/// Size of each slot (entry offset).
pub(crate) const SLOT_SIZE: usize = 2;

/// Size of the key length prefix of an entry.
pub(crate) const KEY_LEN_SIZE: usize = 2;

/// Size of the page pointer stored with every entry.
pub(crate) const POINTER_SIZE: usize = 8;
