//! The entry point of a position map: page 0 of the file.
//!
//! ```rust,ignore
//! last_page: u32
//! ```
//!
//! `last_page` is the number of bucket pages in use. Zero means the map is empty. The file may
//! physically hold more pages than that, e.g. after a truncation, which are reused by later
//! allocations.

use crate::page::{read_u32, write_u32, PAGE_SIZE};

const LAST_PAGE_OFFSET: usize = 0;

/// A view of a page as a position map entry point.
pub struct MapEntryPoint<T> {
    inner: T,
}

impl<T: AsRef<[u8]>> MapEntryPoint<T> {
    pub fn new(inner: T) -> Self {
        debug_assert_eq!(inner.as_ref().len(), PAGE_SIZE);
        MapEntryPoint { inner }
    }

    /// The number of bucket pages in use.
    pub fn last_page(&self) -> u32 {
        read_u32(self.inner.as_ref(), LAST_PAGE_OFFSET)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> MapEntryPoint<T> {
    pub fn set_last_page(&mut self, last_page: u32) {
        write_u32(self.inner.as_mut(), LAST_PAGE_OFFSET, last_page);
    }
}
