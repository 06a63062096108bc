//! The layout of a position map bucket.
//!
//! ```rust,ignore
//! size: u16
//! slots: [Slot; MAX_ENTRIES]
//! ```
//!
//! where every slot is 17 bytes:
//!
//! ```rust,ignore
//! status: u8
//! page_index: u64
//! record_position: u32
//! record_version: i32
//! ```
//!
//! All integers are little-endian. `size` is the number of slots handed out so far; slots are
//! handed out in order, so slots `0..size` are allocated (in any status) and slots
//! `size..MAX_ENTRIES` do not exist.

use crate::page::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64, PAGE_SIZE};
use crate::position::{EntryWithStatus, PositionEntry, SlotStatus};

const SIZE_OFFSET: usize = 0;
const SLOTS_OFFSET: usize = 2;

/// The size of a single slot, in bytes.
pub const SLOT_SIZE: usize = 1 + 8 + 4 + 4;

/// The number of slots in a bucket.
pub const MAX_ENTRIES: usize = (PAGE_SIZE - SLOTS_OFFSET) / SLOT_SIZE;

const STATUS: usize = 0;
const PAGE_INDEX: usize = 1;
const RECORD_POSITION: usize = 9;
const RECORD_VERSION: usize = 13;

/// Why a write into a bucket slot was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWriteError {
    /// The slot has not been handed out.
    OutOfRange,
    /// The slot is a tombstone and may not change anymore.
    Removed,
}

/// A view of a page as a position map bucket.
///
/// Reading requires `T: AsRef<[u8]>`, writing additionally `T: AsMut<[u8]>`.
pub struct Bucket<T> {
    inner: T,
}

impl<T: AsRef<[u8]>> Bucket<T> {
    pub fn new(inner: T) -> Self {
        debug_assert_eq!(inner.as_ref().len(), PAGE_SIZE);
        Bucket { inner }
    }

    fn buf(&self) -> &[u8] {
        self.inner.as_ref()
    }

    /// The number of slots handed out.
    pub fn size(&self) -> usize {
        read_u16(self.buf(), SIZE_OFFSET) as usize
    }

    pub fn is_full(&self) -> bool {
        self.size() >= MAX_ENTRIES
    }

    /// The status of the slot. Slots past the size are [`SlotStatus::NotExistent`].
    pub fn status(&self, index: usize) -> SlotStatus {
        if index >= self.size() {
            return SlotStatus::NotExistent;
        }
        let byte = self.buf()[slot_offset(index) + STATUS];
        // a byte we cannot decode can only come from a torn or foreign page; treat it as absent.
        SlotStatus::from_u8(byte).unwrap_or(SlotStatus::NotExistent)
    }

    /// Whether the slot is filled.
    pub fn exists(&self, index: usize) -> bool {
        self.status(index) == SlotStatus::Filled
    }

    /// The payload of a filled slot.
    pub fn get(&self, index: usize) -> Option<PositionEntry> {
        if self.exists(index) {
            Some(self.payload(index))
        } else {
            None
        }
    }

    /// The status of the slot and, for filled and removed slots, its payload.
    pub fn entry_with_status(&self, index: usize) -> EntryWithStatus {
        let status = self.status(index);
        let entry = if status.has_payload() {
            Some(self.payload(index))
        } else {
            None
        };
        EntryWithStatus { status, entry }
    }

    /// The raw version field of a slot, whatever its status.
    pub fn record_version_at(&self, index: usize) -> i32 {
        read_u32(self.buf(), slot_offset(index) + RECORD_VERSION) as i32
    }

    fn payload(&self, index: usize) -> PositionEntry {
        let offset = slot_offset(index);
        let buf = self.buf();
        PositionEntry {
            page_index: read_u64(buf, offset + PAGE_INDEX),
            record_position: read_u32(buf, offset + RECORD_POSITION),
            record_version: read_u32(buf, offset + RECORD_VERSION) as i32,
        }
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Bucket<T> {
    fn buf_mut(&mut self) -> &mut [u8] {
        self.inner.as_mut()
    }

    /// Reset the bucket to zero handed-out slots.
    pub fn init(&mut self) {
        self.buf_mut().fill(0);
    }

    /// Hand out the next slot with status [`SlotStatus::Allocated`] and return its index.
    ///
    /// Panics if the bucket is full.
    pub fn allocate(&mut self) -> usize {
        let index = self.size();
        assert!(index < MAX_ENTRIES, "allocation in a full bucket");

        let offset = slot_offset(index);
        let buf = self.buf_mut();
        buf[offset..offset + SLOT_SIZE].fill(0);
        buf[offset + STATUS] = SlotStatus::Allocated as u8;
        write_u16(buf, SIZE_OFFSET, index as u16 + 1);
        index
    }

    /// Write the payload of an allocated or filled slot, leaving it filled.
    pub fn set(&mut self, index: usize, entry: PositionEntry) -> Result<(), SlotWriteError> {
        match self.status(index) {
            SlotStatus::NotExistent => return Err(SlotWriteError::OutOfRange),
            SlotStatus::Removed => return Err(SlotWriteError::Removed),
            SlotStatus::Allocated | SlotStatus::Filled => {}
        }

        let offset = slot_offset(index);
        let buf = self.buf_mut();
        buf[offset + STATUS] = SlotStatus::Filled as u8;
        write_u64(buf, offset + PAGE_INDEX, entry.page_index);
        write_u32(buf, offset + RECORD_POSITION, entry.record_position);
        write_u32(buf, offset + RECORD_VERSION, entry.record_version as u32);
        Ok(())
    }

    /// Overwrite only the version of an allocated or filled slot.
    pub fn update_version(&mut self, index: usize, version: i32) -> Result<(), SlotWriteError> {
        match self.status(index) {
            SlotStatus::NotExistent => return Err(SlotWriteError::OutOfRange),
            SlotStatus::Removed => return Err(SlotWriteError::Removed),
            SlotStatus::Allocated | SlotStatus::Filled => {}
        }

        let offset = slot_offset(index) + RECORD_VERSION;
        write_u32(self.buf_mut(), offset, version as u32);
        Ok(())
    }

    /// Retire a filled slot, recording the deletion version.
    ///
    /// Returns `Ok(false)` and leaves the slot untouched if it is allocated or already removed.
    pub fn remove(&mut self, index: usize, deletion_version: i32) -> Result<bool, SlotWriteError> {
        match self.status(index) {
            SlotStatus::NotExistent => Err(SlotWriteError::OutOfRange),
            SlotStatus::Allocated | SlotStatus::Removed => Ok(false),
            SlotStatus::Filled => {
                let offset = slot_offset(index);
                let buf = self.buf_mut();
                buf[offset + STATUS] = SlotStatus::Removed as u8;
                write_u32(buf, offset + RECORD_VERSION, deletion_version as u32);
                Ok(true)
            }
        }
    }
}

fn slot_offset(index: usize) -> usize {
    debug_assert!(index < MAX_ENTRIES);
    SLOTS_OFFSET + index * SLOT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;
    use quickcheck::{QuickCheck, TestResult};

    fn bucket() -> Bucket<Page> {
        let mut bucket = Bucket::new(Page::zeroed());
        bucket.init();
        bucket
    }

    #[test]
    fn slots_fit_in_page() {
        assert_eq!(MAX_ENTRIES, 240);
        assert!(SLOTS_OFFSET + MAX_ENTRIES * SLOT_SIZE <= PAGE_SIZE);
    }

    #[test]
    fn allocate_until_full() {
        let mut bucket = bucket();
        for i in 0..MAX_ENTRIES {
            assert!(!bucket.is_full());
            assert_eq!(bucket.allocate(), i);
        }
        assert!(bucket.is_full());
        assert_eq!(bucket.size(), MAX_ENTRIES);
        assert_eq!(bucket.status(MAX_ENTRIES - 1), SlotStatus::Allocated);
    }

    #[test]
    fn slot_lifecycle() {
        let mut bucket = bucket();
        let index = bucket.allocate();
        assert_eq!(bucket.status(index), SlotStatus::Allocated);
        assert_eq!(bucket.get(index), None);

        let entry = PositionEntry::new(10, 42, 1);
        bucket.set(index, entry).unwrap();
        assert_eq!(bucket.get(index), Some(entry));

        assert_eq!(bucket.remove(index, 7), Ok(true));
        assert_eq!(bucket.get(index), None);
        let with_status = bucket.entry_with_status(index);
        assert_eq!(with_status.status, SlotStatus::Removed);
        assert_eq!(with_status.entry, Some(PositionEntry::new(10, 42, 7)));

        assert_eq!(bucket.remove(index, 9), Ok(false));
        assert_eq!(bucket.record_version_at(index), 7);
        assert_eq!(bucket.set(index, entry), Err(SlotWriteError::Removed));
        assert_eq!(bucket.update_version(index, 3), Err(SlotWriteError::Removed));
    }

    #[test]
    fn writes_past_size_are_rejected() {
        let mut bucket = bucket();
        bucket.allocate();
        assert_eq!(
            bucket.set(1, PositionEntry::default()),
            Err(SlotWriteError::OutOfRange)
        );
        assert_eq!(bucket.update_version(5, 1), Err(SlotWriteError::OutOfRange));
        assert_eq!(bucket.remove(2, 1), Err(SlotWriteError::OutOfRange));
        assert_eq!(bucket.status(1), SlotStatus::NotExistent);
    }

    #[test]
    fn version_update_keeps_location() {
        let mut bucket = bucket();
        let index = bucket.allocate();
        bucket.update_version(index, 5).unwrap();
        assert_eq!(bucket.status(index), SlotStatus::Allocated);

        bucket.set(index, PositionEntry::new(3, 4, 5)).unwrap();
        bucket.update_version(index, -2).unwrap();
        assert_eq!(bucket.get(index), Some(PositionEntry::new(3, 4, -2)));
    }

    #[test]
    fn neighbours_are_untouched() {
        fn prop(entries: Vec<(u64, u32, i32)>) -> TestResult {
            if entries.is_empty() || entries.len() > MAX_ENTRIES {
                return TestResult::discard();
            }
            let mut bucket = bucket();
            for &(page, pos, version) in &entries {
                let index = bucket.allocate();
                bucket
                    .set(index, PositionEntry::new(page, pos, version))
                    .unwrap();
            }
            for (index, &(page, pos, version)) in entries.iter().enumerate() {
                if bucket.get(index) != Some(PositionEntry::new(page, pos, version)) {
                    return TestResult::failed();
                }
            }
            TestResult::passed()
        }

        QuickCheck::new()
            .tests(100)
            .quickcheck(prop as fn(Vec<(u64, u32, i32)>) -> TestResult);
    }
}
