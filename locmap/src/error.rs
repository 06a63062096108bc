//! Errors which callers of the index may need to tell apart.
//!
//! Every fallible function of this crate returns [`anyhow::Result`]. The errors below travel
//! inside it and can be recovered with [`anyhow::Error::downcast_ref`]. I/O errors are passed
//! through unchanged.

use thiserror::Error;

use crate::store::FileId;

/// Errors raised by the page store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file {0:?} does not exist")]
    FileNotFound(String),

    #[error("file {0:?} is not open")]
    UnknownFile(FileId),

    #[error("a file named {0:?} already exists")]
    FileExists(String),

    #[error("page {index} of file {name:?} is beyond the end of the file ({len} pages)")]
    PageOutOfBounds { name: String, index: u64, len: u64 },
}

/// Errors raised by writes into a collection position map.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PositionMapError {
    #[error("position {position} is outside of the range of position map {name:?}")]
    OutOfRange { name: String, position: u64 },

    #[error("position {position} of position map {name:?} has been removed")]
    RemovedEntry { name: String, position: u64 },
}

/// Errors raised by the free-space map.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FreeSpaceMapError {
    #[error("page index {page_index} exceeds the capacity of the free-space map (max {max})")]
    PageIndexOutOfRange { page_index: u64, max: u64 },
}
