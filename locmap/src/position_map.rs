//! The collection position map: logical record positions to physical record locations.
//!
//! Page 0 of the file is the [entry point](locmap_core::entry_point), every following page is
//! a [bucket](locmap_core::bucket) of `MAX_ENTRIES` slots. Position `p` lives in slot
//! `p % MAX_ENTRIES` of bucket page `p / MAX_ENTRIES + 1`. Positions are handed out in order and
//! never reused.

use anyhow::Result;
use locmap_core::{
    bucket::{Bucket, SlotWriteError, MAX_ENTRIES},
    entry_point::MapEntryPoint,
    CollectionPositionEntry, EntryWithStatus, Page, PositionEntry, SlotStatus,
};

use crate::{
    error::PositionMapError,
    store::{AtomicOperation, FileId, PageStore},
};

/// The extension of position map files.
pub const EXTENSION: &str = ".cpm";

const MAX: u64 = MAX_ENTRIES as u64;

fn page_of(position: u64) -> u64 {
    position / MAX + 1
}

fn slot_of(position: u64) -> usize {
    (position % MAX) as usize
}

fn first_position_of(page_index: u64) -> u64 {
    (page_index - 1) * MAX
}

/// The position map of one collection, stored in the file `<name>.cpm`.
///
/// The map is a handle: it remembers its name and the id of its file once created or opened.
/// All page access happens through the atomic operation passed to each call.
pub struct CollectionPositionMap {
    name: String,
    file: Option<FileId>,
}

impl CollectionPositionMap {
    pub fn new(name: impl Into<String>) -> Self {
        CollectionPositionMap {
            name: name.into(),
            file: None,
        }
    }

    /// The logical name of the map.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name of the backing file.
    pub fn full_name(&self) -> String {
        format!("{}{}", self.name, EXTENSION)
    }

    /// The id of the backing file, once created or opened.
    pub fn file_id(&self) -> Option<FileId> {
        self.file
    }

    fn file(&self) -> Result<FileId> {
        match self.file {
            Some(file) => Ok(file),
            None => anyhow::bail!("position map {:?} is not open", self.name),
        }
    }

    /// Create the map, or reset an existing file to an empty map.
    pub fn create(&mut self, op: &mut AtomicOperation) -> Result<()> {
        let full_name = self.full_name();
        let file = if op.file_exists(&full_name)? {
            op.load_file(&full_name)?
        } else {
            op.add_file(&full_name)?
        };

        let entry_point = if op.filled_up_to(file)? == 0 {
            op.add_page(file)?.1
        } else {
            op.load_page_for_write(file, 0)?
        };
        MapEntryPoint::new(entry_point).set_last_page(0);

        self.file = Some(file);
        tracing::debug!(name = %self.name, "created position map");
        Ok(())
    }

    /// Attach to an existing map.
    pub fn open(&mut self, op: &mut AtomicOperation) -> Result<()> {
        self.file = Some(op.load_file(&self.full_name())?);
        Ok(())
    }

    /// Forget every position. The file keeps its pages, which later allocations reuse.
    pub fn truncate(&self, op: &mut AtomicOperation) -> Result<()> {
        let file = self.file()?;
        MapEntryPoint::new(op.load_page_for_write(file, 0)?).set_last_page(0);
        tracing::debug!(name = %self.name, "truncated position map");
        Ok(())
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

    /// Make the committed content of the map durable.
    pub fn flush(&self, store: &PageStore) -> Result<()> {
        store.flush_file(self.file()?)
    }

    /// Release the backing file, optionally flushing it first.
    pub fn close(&mut self, store: &PageStore, flush: bool) -> Result<()> {
        store.close_file(self.file()?, flush)?;
        self.file = None;
        Ok(())
    }

    fn last_page(&self, file: FileId, op: &AtomicOperation) -> Result<u64> {
        let entry_point = op.load_page_for_read(file, 0)?;
        Ok(MapEntryPoint::new(&*entry_point).last_page() as u64)
    }

    /// Reserve the next position. Its slot is [`SlotStatus::Allocated`] until updated.
    pub fn allocate(&self, op: &mut AtomicOperation) -> Result<u64> {
        let file = self.file()?;

        // the entry point lock serializes allocations.
        let last_page = MapEntryPoint::new(&*op.load_page_for_write(file, 0)?).last_page() as u64;
        let filled_up_to = op.filled_up_to(file)?;
        if last_page >= filled_up_to {
            anyhow::bail!(
                "position map {:?} claims {last_page} buckets but has {filled_up_to} pages",
                self.name
            );
        }

        let has_room = last_page != 0
            && !Bucket::new(&*op.load_page_for_write(file, last_page)?).is_full();

        let page_index = if has_room {
            last_page
        } else {
            let next = last_page + 1;
            let Ok(next_last_page) = u32::try_from(next) else {
                anyhow::bail!("position map {:?} is full", self.name);
            };

            let page = if next < filled_up_to {
                // left behind by a truncation.
                op.load_page_for_write(file, next)?
            } else {
                let (index, page) = op.add_page(file)?;
                debug_assert_eq!(index, next);
                page
            };
            Bucket::new(page).init();
            MapEntryPoint::new(op.load_page_for_write(file, 0)?).set_last_page(next_last_page);
            next
        };

        let index = Bucket::new(op.load_page_for_write(file, page_index)?).allocate();
        Ok(first_position_of(page_index) + index as u64)
    }

    fn bucket_for_write<'a>(
        &self,
        position: u64,
        op: &'a mut AtomicOperation,
    ) -> Result<Bucket<&'a mut Page>> {
        let file = self.file()?;
        let page_index = page_of(position);
        // the entry point is locked before any bucket, as in `allocate`.
        let last_page = MapEntryPoint::new(&*op.load_page_for_write(file, 0)?).last_page() as u64;
        if page_index > last_page {
            return Err(self.out_of_range(position));
        }
        Ok(Bucket::new(op.load_page_for_write(file, page_index)?))
    }

    fn out_of_range(&self, position: u64) -> anyhow::Error {
        PositionMapError::OutOfRange {
            name: self.name.clone(),
            position,
        }
        .into()
    }

    fn slot_error(&self, position: u64, err: SlotWriteError) -> anyhow::Error {
        match err {
            SlotWriteError::OutOfRange => self.out_of_range(position),
            SlotWriteError::Removed => PositionMapError::RemovedEntry {
                name: self.name.clone(),
                position,
            }
            .into(),
        }
    }

    /// Record the physical location of an allocated or filled position, leaving it filled.
    ///
    /// Fails with [`PositionMapError::OutOfRange`] for positions never allocated and with
    /// [`PositionMapError::RemovedEntry`] for removed ones.
    pub fn update(
        &self,
        position: u64,
        entry: PositionEntry,
        op: &mut AtomicOperation,
    ) -> Result<()> {
        self.bucket_for_write(position, op)?
            .set(slot_of(position), entry)
            .map_err(|e| self.slot_error(position, e))
    }

    /// Overwrite only the version of an allocated or filled position.
    pub fn update_version(
        &self,
        position: u64,
        version: i32,
        op: &mut AtomicOperation,
    ) -> Result<()> {
        self.bucket_for_write(position, op)?
            .update_version(slot_of(position), version)
            .map_err(|e| self.slot_error(position, e))
    }

    /// Retire a filled position, keeping `deletion_version` in its tombstone.
    ///
    /// Allocated and already removed positions are left as they are.
    pub fn remove(
        &self,
        position: u64,
        deletion_version: i32,
        op: &mut AtomicOperation,
    ) -> Result<()> {
        self.bucket_for_write(position, op)?
            .remove(slot_of(position), deletion_version)
            .map(|_| ())
            .map_err(|e| self.slot_error(position, e))
    }

    fn read_slot<T>(
        &self,
        position: u64,
        op: &AtomicOperation,
        absent: T,
        read: impl FnOnce(&Bucket<&Page>, usize) -> T,
    ) -> Result<T> {
        let file = self.file()?;
        let page_index = page_of(position);
        if page_index > self.last_page(file, op)? {
            return Ok(absent);
        }
        let page = op.load_page_for_read(file, page_index)?;
        Ok(read(&Bucket::new(&*page), slot_of(position)))
    }

    /// The location of a filled position. `None` for anything else.
    pub fn get(&self, position: u64, op: &AtomicOperation) -> Result<Option<PositionEntry>> {
        self.read_slot(position, op, None, |bucket, slot| bucket.get(slot))
    }

    /// The status of a position with its payload, tombstones included.
    pub fn get_with_status(
        &self,
        position: u64,
        op: &AtomicOperation,
    ) -> Result<EntryWithStatus> {
        self.read_slot(position, op, EntryWithStatus::NOT_EXISTENT, |bucket, slot| {
            bucket.entry_with_status(slot)
        })
    }

    pub fn get_status(&self, position: u64, op: &AtomicOperation) -> Result<SlotStatus> {
        self.read_slot(position, op, SlotStatus::NotExistent, |bucket, slot| {
            bucket.status(slot)
        })
    }

    /// The lowest filled position.
    pub fn first_position(&self, op: &AtomicOperation) -> Result<Option<u64>> {
        let file = self.file()?;
        let last_page = self.last_page(file, op)?;
        for page_index in 1..=last_page {
            let page = op.load_page_for_read(file, page_index)?;
            let bucket = Bucket::new(&*page);
            if let Some(slot) = (0..bucket.size()).find(|&slot| bucket.exists(slot)) {
                return Ok(Some(first_position_of(page_index) + slot as u64));
            }
        }
        Ok(None)
    }

    /// The highest filled position.
    pub fn last_position(&self, op: &AtomicOperation) -> Result<Option<u64>> {
        let file = self.file()?;
        let last_page = self.last_page(file, op)?;
        for page_index in (1..=last_page).rev() {
            let page = op.load_page_for_read(file, page_index)?;
            let bucket = Bucket::new(&*page);
            if let Some(slot) = (0..bucket.size()).rev().find(|&slot| bucket.exists(slot)) {
                return Ok(Some(first_position_of(page_index) + slot as u64));
            }
        }
        Ok(None)
    }

    /// Filled positions `>= from` in ascending order, at most `limit` of them.
    fn ceiling_entries(
        &self,
        from: i64,
        limit: usize,
        op: &AtomicOperation,
    ) -> Result<Vec<(u64, PositionEntry)>> {
        let file = self.file()?;
        let from = from.max(0) as u64;
        let limit = if limit == 0 { usize::MAX } else { limit };
        let last_page = self.last_page(file, op)?;

        let mut page_index = page_of(from);
        let mut slot = slot_of(from);
        let mut result = Vec::new();
        while page_index <= last_page && result.len() < limit {
            let page = op.load_page_for_read(file, page_index)?;
            let bucket = Bucket::new(&*page);
            let start = first_position_of(page_index);
            for slot in slot..bucket.size() {
                if result.len() == limit {
                    break;
                }
                if let Some(entry) = bucket.get(slot) {
                    result.push((start + slot as u64, entry));
                }
            }
            page_index += 1;
            slot = 0;
        }
        Ok(result)
    }

    /// Filled positions `<= to` in descending order, at most `limit` of them.
    fn floor_entries(
        &self,
        to: i64,
        limit: usize,
        op: &AtomicOperation,
    ) -> Result<Vec<(u64, PositionEntry)>> {
        let file = self.file()?;
        if to < 0 {
            return Ok(Vec::new());
        }
        let to = to as u64;
        let limit = if limit == 0 { usize::MAX } else { limit };
        let last_page = self.last_page(file, op)?;

        // `None` means from the end of the bucket.
        let (mut page_index, mut slot) = (page_of(to), Some(slot_of(to)));
        if page_index > last_page {
            page_index = last_page;
            slot = None;
        }

        let mut result = Vec::new();
        while page_index >= 1 && result.len() < limit {
            let page = op.load_page_for_read(file, page_index)?;
            let bucket = Bucket::new(&*page);
            let start = first_position_of(page_index);
            let end = match slot {
                Some(slot) => (slot + 1).min(bucket.size()),
                None => bucket.size(),
            };
            for slot in (0..end).rev() {
                if result.len() == limit {
                    break;
                }
                if let Some(entry) = bucket.get(slot) {
                    result.push((start + slot as u64, entry));
                }
            }
            page_index -= 1;
            slot = None;
        }
        Ok(result)
    }

    /// Up to `limit` filled positions `>= from`, ascending. A `limit` of zero means no limit.
    pub fn ceiling_positions(
        &self,
        from: i64,
        op: &AtomicOperation,
        limit: usize,
    ) -> Result<Vec<u64>> {
        Ok(self
            .ceiling_entries(from, limit, op)?
            .into_iter()
            .map(|(position, _)| position)
            .collect())
    }

    /// Up to `limit` filled positions `> from`, ascending.
    pub fn higher_positions(
        &self,
        from: i64,
        op: &AtomicOperation,
        limit: usize,
    ) -> Result<Vec<u64>> {
        if from == i64::MAX {
            return Ok(Vec::new());
        }
        self.ceiling_positions(from + 1, op, limit)
    }

    /// Every filled entry with a position `> from`, ascending.
    pub fn higher_positions_entries(
        &self,
        from: i64,
        op: &AtomicOperation,
    ) -> Result<Vec<CollectionPositionEntry>> {
        self.higher_entries(from, 0, op)
    }

    pub(crate) fn higher_entries(
        &self,
        from: i64,
        limit: usize,
        op: &AtomicOperation,
    ) -> Result<Vec<CollectionPositionEntry>> {
        if from == i64::MAX {
            return Ok(Vec::new());
        }
        Ok(self
            .ceiling_entries(from + 1, limit, op)?
            .into_iter()
            .map(|(position, entry)| CollectionPositionEntry::new(position, entry))
            .collect())
    }

    /// Up to `limit` filled positions `<= to`, ascending. With a limit, the highest ones are
    /// kept.
    pub fn floor_positions(
        &self,
        to: i64,
        op: &AtomicOperation,
        limit: usize,
    ) -> Result<Vec<u64>> {
        let mut positions: Vec<u64> = self
            .floor_entries(to, limit, op)?
            .into_iter()
            .map(|(position, _)| position)
            .collect();
        positions.reverse();
        Ok(positions)
    }

    /// Up to `limit` filled positions `< to`, ascending. With a limit, the highest ones are kept.
    pub fn lower_positions(
        &self,
        to: i64,
        op: &AtomicOperation,
        limit: usize,
    ) -> Result<Vec<u64>> {
        if to <= 0 {
            return Ok(Vec::new());
        }
        self.floor_positions(to - 1, op, limit)
    }

    /// Every filled entry with a position `< to`, highest first.
    pub fn lower_positions_entries_reversed(
        &self,
        to: i64,
        op: &AtomicOperation,
    ) -> Result<Vec<CollectionPositionEntry>> {
        self.lower_entries_reversed(to, 0, op)
    }

    pub(crate) fn lower_entries_reversed(
        &self,
        to: i64,
        limit: usize,
        op: &AtomicOperation,
    ) -> Result<Vec<CollectionPositionEntry>> {
        if to <= 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .floor_entries(to - 1, limit, op)?
            .into_iter()
            .map(|(position, entry)| CollectionPositionEntry::new(position, entry))
            .collect())
    }

    /// Visit every filled and removed position in ascending order with its status and version.
    pub fn for_each_entry(
        &self,
        op: &AtomicOperation,
        mut visitor: impl FnMut(u64, SlotStatus, i32),
    ) -> Result<()> {
        let file = self.file()?;
        let last_page = self.last_page(file, op)?;
        for page_index in 1..=last_page {
            let page = op.load_page_for_read(file, page_index)?;
            let bucket = Bucket::new(&*page);
            let start = first_position_of(page_index);
            for slot in 0..bucket.size() {
                let status = bucket.status(slot);
                if status.has_payload() {
                    visitor(start + slot as u64, status, bucket.record_version_at(slot));
                }
            }
        }
        Ok(())
    }
}
