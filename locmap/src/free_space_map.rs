//! The free-space map: which data page of a collection has room for a record of a given size.
//!
//! Free space is stored per data page as a class, `free_bytes / NORMALIZATION_INTERVAL`, in a
//! two-level tree of [segment-tree pages](locmap_core::fsm_page). Page 0 is the first level;
//! its leaf `j` holds the largest class of second-level page `j + 1`. Second-level page `k`
//! holds the classes of data pages `(k - 1) * CELLS_PER_PAGE .. k * CELLS_PER_PAGE` and is
//! materialised on the first update that needs it.

use anyhow::Result;
use locmap_core::{
    fsm_page::{FreeSpacePage, CELLS_PER_PAGE},
    PAGE_SIZE,
};

use crate::{
    error::FreeSpaceMapError,
    store::{AtomicOperation, FileId, PageStore},
};

/// The extension of free-space map files.
pub const EXTENSION: &str = ".fsm";

/// The number of free bytes one class stands for.
pub const NORMALIZATION_INTERVAL: u32 = (PAGE_SIZE / 256) as u32;

/// The highest data page index the map can track.
pub const MAX_PAGE_INDEX: u64 = (CELLS_PER_PAGE * CELLS_PER_PAGE - 1) as u64;

const CELLS: u64 = CELLS_PER_PAGE as u64;
const FIRST_LEVEL: u64 = 0;

/// The class stored for a page with `free_bytes` bytes free.
pub fn normalize(free_bytes: u32) -> u8 {
    // a completely empty page would be class 256.
    (free_bytes / NORMALIZATION_INTERVAL).min(u8::MAX as u32) as u8
}

/// The smallest class a page needs for its free space to exceed `required_bytes`.
///
/// One class above the rounded-up request: a stored class only promises its lower bound.
pub fn required_class(required_bytes: u32) -> u32 {
    required_bytes.div_ceil(NORMALIZATION_INTERVAL) + 1
}

/// The free-space map of one collection, stored in the file `<name>.fsm`.
pub struct FreeSpaceMap {
    name: String,
    file: Option<FileId>,
}

impl FreeSpaceMap {
    pub fn new(name: impl Into<String>) -> Self {
        FreeSpaceMap {
            name: name.into(),
            file: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name of the backing file.
    pub fn full_name(&self) -> String {
        format!("{}{}", self.name, EXTENSION)
    }

    pub fn file_id(&self) -> Option<FileId> {
        self.file
    }

    fn file(&self) -> Result<FileId> {
        match self.file {
            Some(file) => Ok(file),
            None => anyhow::bail!("free-space map {:?} is not open", self.name),
        }
    }

    /// Create an empty map. An existing file is reused with every page cleared.
    pub fn create(&mut self, op: &mut AtomicOperation) -> Result<()> {
        let full_name = self.full_name();
        let file = if op.file_exists(&full_name)? {
            op.load_file(&full_name)?
        } else {
            op.add_file(&full_name)?
        };

        let pages = op.filled_up_to(file)?;
        if pages == 0 {
            op.add_page(file)?;
        }
        for index in 0..pages {
            FreeSpacePage::new(op.load_page_for_write(file, index)?).init();
        }

        self.file = Some(file);
        tracing::debug!(name = %self.name, "created free-space map");
        Ok(())
    }

    /// Attach to an existing map.
    pub fn open(&mut self, op: &mut AtomicOperation) -> Result<()> {
        self.file = Some(op.load_file(&self.full_name())?);
        Ok(())
    }

    /// Whether the backing file exists. Does not attach to it.
    pub fn exists(&self, op: &AtomicOperation) -> Result<bool> {
        op.file_exists(&self.full_name())
    }

    /// Record the free space of a data page, replacing what was stored before.
    ///
    /// The first-level page is locked first, so updates of one map serialize on it.
    pub fn update_page_free_space(
        &self,
        op: &mut AtomicOperation,
        page_index: u64,
        free_bytes: u32,
    ) -> Result<()> {
        if page_index > MAX_PAGE_INDEX {
            return Err(FreeSpaceMapError::PageIndexOutOfRange {
                page_index,
                max: MAX_PAGE_INDEX,
            }
            .into());
        }

        let file = self.file()?;
        let second_level = page_index / CELLS + 1;
        let cell = (page_index % CELLS) as usize;

        if op.filled_up_to(file)? == 0 {
            // zeroed pages are empty trees.
            op.add_page(file)?;
        }
        op.load_page_for_write(file, FIRST_LEVEL)?;
        // counted under the first-level lock: no other update can grow the file meanwhile.
        let mut pages = op.filled_up_to(file)?;
        while pages <= second_level {
            let (index, _) = op.add_page(file)?;
            tracing::trace!(name = %self.name, index, "expanded free-space map");
            pages += 1;
        }

        let max = FreeSpacePage::new(op.load_page_for_write(file, second_level)?)
            .update(cell, normalize(free_bytes));
        FreeSpacePage::new(op.load_page_for_write(file, FIRST_LEVEL)?)
            .update((second_level - 1) as usize, max);
        Ok(())
    }

    /// The lowest data page index with more than `required_bytes` bytes free, if any.
    pub fn find_free_page(&self, op: &AtomicOperation, required_bytes: u32) -> Result<Option<u64>> {
        let file = self.file()?;
        let required = required_class(required_bytes);
        let pages = op.filled_up_to(file)?;
        if pages == 0 {
            return Ok(None);
        }

        let first_level = op.load_page_for_read(file, FIRST_LEVEL)?;
        let Some(leaf) = FreeSpacePage::new(&*first_level).find(required) else {
            return Ok(None);
        };
        let second_level = leaf as u64 + 1;
        if second_level >= pages {
            anyhow::bail!(
                "free-space map {:?} points at page {second_level} of {pages}",
                self.name
            );
        }

        let page = op.load_page_for_read(file, second_level)?;
        // both levels are read at the operation's snapshot, so they agree.
        Ok(FreeSpacePage::new(&*page)
            .find(required)
            .map(|cell| (second_level - 1) * CELLS + cell as u64))
    }

    /// Delete the backing file when `op` commits.
    pub fn delete(&mut self, op: &mut AtomicOperation) -> Result<()> {
        op.delete_file(self.file()?)?;
        self.file = None;
        Ok(())
    }

    /// Rename the map and its backing file.
    pub fn rename(&mut self, store: &PageStore, new_name: &str) -> Result<()> {
        let file = self.file()?;
        store.rename_file(file, &format!("{new_name}{EXTENSION}"))?;
        self.name = new_name.to_string();
        Ok(())
    }

    pub fn flush(&self, store: &PageStore) -> Result<()> {
        store.flush_file(self.file()?)
    }

    pub fn close(&mut self, store: &PageStore, flush: bool) -> Result<()> {
        store.close_file(self.file()?, flush)?;
        self.file = None;
        Ok(())
    }
}
