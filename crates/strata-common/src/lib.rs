//! Strata common types, errors, and utilities.
//!
//! This crate provides the page primitives, locators, error type and
//! configuration shared by every Strata storage component.

pub mod config;
pub mod error;
pub mod page;
pub mod types;

pub use config::{RunConfig, StorageConfig};
pub use error::{Result, StrataError};
pub use page::{PageHeader, PageId, PageType, PAGE_SIZE};
pub use types::{Extent, RecordId, Xid};
