//! The location index of one collection: its position map and its free-space map, managed
//! together.

use anyhow::Result;
use locmap_core::{bucket::MAX_ENTRIES, CollectionPositionEntry, SlotStatus};

use crate::{
    free_space_map::FreeSpaceMap,
    position_map::CollectionPositionMap,
    store::{AtomicOperation, PageStore},
};

/// Rebuild progress is logged every this many data pages.
const REBUILD_LOG_INTERVAL: u64 = 1_000;

/// The state of a record position as seen by the users of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordStatus {
    NotExistent,
    Allocated,
    Present,
    Removed,
}

impl From<SlotStatus> for RecordStatus {
    fn from(status: SlotStatus) -> Self {
        match status {
            SlotStatus::NotExistent => RecordStatus::NotExistent,
            SlotStatus::Allocated => RecordStatus::Allocated,
            SlotStatus::Filled => RecordStatus::Present,
            SlotStatus::Removed => RecordStatus::Removed,
        }
    }
}

/// One step of browsing a collection: a run of filled positions in browsing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowsePage {
    entries: Vec<CollectionPositionEntry>,
}

impl BrowsePage {
    pub fn entries(&self) -> &[CollectionPositionEntry] {
        &self.entries
    }

    /// The position to pass to [`CollectionIndex::next_page`] to continue browsing.
    pub fn last_position(&self) -> u64 {
        // UNWRAP: pages are never empty.
        self.entries.last().unwrap().position
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for BrowsePage {
    type Item = CollectionPositionEntry;
    type IntoIter = std::vec::IntoIter<CollectionPositionEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// The position map and the free-space map of a collection named `name`, stored in
/// `<name>.cpm` and `<name>.fsm`.
pub struct CollectionIndex {
    name: String,
    position_map: CollectionPositionMap,
    free_space_map: FreeSpaceMap,
}

impl CollectionIndex {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        CollectionIndex {
            position_map: CollectionPositionMap::new(name.clone()),
            free_space_map: FreeSpaceMap::new(name.clone()),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position_map(&self) -> &CollectionPositionMap {
        &self.position_map
    }

    pub fn free_space_map(&self) -> &FreeSpaceMap {
        &self.free_space_map
    }

    /// Create both maps.
    pub fn create(&mut self, op: &mut AtomicOperation) -> Result<()> {
        self.position_map.create(op)?;
        self.free_space_map.create(op)?;
        Ok(())
    }

    /// Open both maps.
    ///
    /// A missing free-space map is created and filled from `probe`, which is asked for the
    /// free bytes of every data page `0..data_pages`.
    #[tracing::instrument(level = "debug", skip_all, fields(collection = %self.name))]
    pub fn open(
        &mut self,
        op: &mut AtomicOperation,
        data_pages: u64,
        mut probe: impl FnMut(u64) -> Result<u32>,
    ) -> Result<()> {
        self.position_map.open(op)?;
        if self.free_space_map.exists(op)? {
            return self.free_space_map.open(op);
        }

        tracing::info!(data_pages, "free-space map is absent, rebuilding it");
        self.free_space_map.create(op)?;
        for page_index in 0..data_pages {
            let free_bytes = probe(page_index)?;
            self.free_space_map
                .update_page_free_space(op, page_index, free_bytes)?;

            if page_index > 0 && page_index % REBUILD_LOG_INTERVAL == 0 {
                tracing::info!(
                    processed = page_index + 1,
                    data_pages,
                    percent = 100 * (page_index + 1) / data_pages,
                    "rebuilding free-space map"
                );
            }
        }
        tracing::info!("free-space map rebuilt");
        Ok(())
    }

    /// Forget every position and every free-space record.
    pub fn truncate(&mut self, op: &mut AtomicOperation) -> Result<()> {
        self.position_map.truncate(op)?;
        self.free_space_map.create(op)?;
        tracing::debug!(collection = %self.name, "truncated collection index");
        Ok(())
    }

    /// Rename both maps. If the second rename fails the first one is undone.
    pub fn rename(&mut self, store: &PageStore, new_name: &str) -> Result<()> {
        let old_name = self.name.clone();
        self.position_map.rename(store, new_name)?;
        if let Err(e) = self.free_space_map.rename(store, new_name) {
            if let Err(undo) = self.position_map.rename(store, &old_name) {
                tracing::warn!(
                    collection = %old_name,
                    "failed to undo position map rename: {undo}"
                );
            }
            return Err(e);
        }
        self.name = new_name.to_string();
        Ok(())
    }

    /// Delete both maps when `op` commits.
    pub fn delete(&mut self, op: &mut AtomicOperation) -> Result<()> {
        self.position_map.delete(op)?;
        self.free_space_map.delete(op)?;
        Ok(())
    }

    pub fn flush(&self, store: &PageStore) -> Result<()> {
        self.position_map.flush(store)?;
        self.free_space_map.flush(store)
    }

    pub fn close(&mut self, store: &PageStore, flush: bool) -> Result<()> {
        self.position_map.close(store, flush)?;
        self.free_space_map.close(store, flush)
    }

    /// The next run of filled positions after `prev`, at most one bucket worth of them.
    ///
    /// Forward pages hold ascending positions greater than `prev`, backward pages descending
    /// positions lower than `prev`. Without `prev` browsing starts at the first or the last
    /// position. `None` once there is nothing left.
    pub fn next_page(
        &self,
        prev: Option<u64>,
        forward: bool,
        op: &AtomicOperation,
    ) -> Result<Option<BrowsePage>> {
        let entries = if forward {
            let from = prev.map_or(-1, clamp_position);
            self.position_map.higher_entries(from, MAX_ENTRIES, op)?
        } else {
            let to = prev.map_or(i64::MAX, clamp_position);
            self.position_map.lower_entries_reversed(to, MAX_ENTRIES, op)?
        };

        if entries.is_empty() {
            Ok(None)
        } else {
            Ok(Some(BrowsePage { entries }))
        }
    }

    /// The status of a record position.
    pub fn record_status(&self, position: u64, op: &AtomicOperation) -> Result<RecordStatus> {
        Ok(self.position_map.get_status(position, op)?.into())
    }
}

fn clamp_position(position: u64) -> i64 {
    i64::try_from(position).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Options;

    #[test]
    fn record_status_mapping() {
        assert_eq!(RecordStatus::from(SlotStatus::Filled), RecordStatus::Present);
        assert_eq!(
            RecordStatus::from(SlotStatus::NotExistent),
            RecordStatus::NotExistent
        );
        assert_eq!(RecordStatus::from(SlotStatus::Removed), RecordStatus::Removed);
        assert_eq!(
            RecordStatus::from(SlotStatus::Allocated),
            RecordStatus::Allocated
        );
    }

    #[test]
    fn browse_pages_hold_one_bucket() {
        let store = PageStore::open(&Options::new()).unwrap();
        let mut index = CollectionIndex::new("c");
        store
            .execute_inside_atomic_operation(|op| {
                index.create(op)?;
                for i in 0..(MAX_ENTRIES as u64 * 2 + 10) {
                    let position = index.position_map().allocate(op)?;
                    index.position_map().update(
                        position,
                        locmap_core::PositionEntry::new(i, 0, 1),
                        op,
                    )?;
                }
                Ok(())
            })
            .unwrap();

        let op = store.begin_atomic_operation();
        let mut seen = 0;
        let mut prev = None;
        while let Some(page) = index.next_page(prev, true, &op).unwrap() {
            assert!(page.len() <= MAX_ENTRIES);
            seen += page.len();
            prev = Some(page.last_position());
        }
        assert_eq!(seen, MAX_ENTRIES * 2 + 10);

        let page = index.next_page(None, false, &op).unwrap().unwrap();
        assert_eq!(page.entries()[0].position, MAX_ENTRIES as u64 * 2 + 9);
        assert!(page.entries().windows(2).all(|w| w[0].position > w[1].position));
    }
}
