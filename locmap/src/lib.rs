//! Record-location indexing for a page-oriented storage engine.
//!
//! Every collection of records owns two paged structures:
//!
//! - a [`CollectionPositionMap`], which resolves a logical record position to the page, slot
//!   and version of the record and tracks whether the position is allocated, filled or removed;
//! - a [`FreeSpaceMap`], which finds the lowest data page with room for a record of a given size.
//!
//! [`CollectionIndex`] manages both for one collection. All of them read and write pages through
//! an [`AtomicOperation`] of a [`PageStore`].

pub use locmap_core::{
    bucket::MAX_ENTRIES, CollectionPositionEntry, EntryWithStatus, Page, PositionEntry,
    SlotStatus, PAGE_SIZE,
};

pub use collection::{BrowsePage, CollectionIndex, RecordStatus};
pub use error::{FreeSpaceMapError, PositionMapError, StoreError};
pub use free_space_map::FreeSpaceMap;
pub use metrics::{Metric, Metrics};
pub use options::Options;
pub use position_map::CollectionPositionMap;
pub use store::{AtomicOperation, DirectoryStorage, FileId, MemoryStorage, PageStore, Storage};

pub mod collection;
pub mod error;
pub mod free_space_map;
mod metrics;
mod options;
pub mod position_map;
pub mod store;
mod sys;
