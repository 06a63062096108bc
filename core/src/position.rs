//! Logical positions and the payloads they resolve to.

#[cfg(feature = "borsh")]
use borsh::{BorshDeserialize, BorshSerialize};

/// The state of a single position slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SlotStatus {
    /// Never allocated, or beyond the tracked range. Implied, never written for a live slot.
    NotExistent = 0,
    /// Reserved, but no payload has been written yet.
    Allocated = 1,
    /// Holds a valid physical location.
    Filled = 2,
    /// Retired. The payload is kept as a tombstone with the deletion version.
    Removed = 3,
}

impl SlotStatus {
    /// Decode a status byte. Unknown bytes decode to `None`.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(SlotStatus::NotExistent),
            1 => Some(SlotStatus::Allocated),
            2 => Some(SlotStatus::Filled),
            3 => Some(SlotStatus::Removed),
            _ => None,
        }
    }

    /// Whether the slot carries a payload, live or tombstoned.
    pub fn has_payload(&self) -> bool {
        matches!(self, SlotStatus::Filled | SlotStatus::Removed)
    }
}

/// The physical location of a record: a page of the collection's data file, the slot of the
/// record within that page and the record version.
///
/// For a removed position the version is the deletion version, not the last live version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "borsh", derive(BorshSerialize, BorshDeserialize))]
pub struct PositionEntry {
    pub page_index: u64,
    pub record_position: u32,
    pub record_version: i32,
}

impl PositionEntry {
    pub fn new(page_index: u64, record_position: u32, record_version: i32) -> Self {
        PositionEntry {
            page_index,
            record_position,
            record_version,
        }
    }
}

/// A slot status together with its payload, if the status carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryWithStatus {
    pub status: SlotStatus,
    /// `Some` only for [`SlotStatus::Filled`] and [`SlotStatus::Removed`].
    pub entry: Option<PositionEntry>,
}

impl EntryWithStatus {
    /// The status of a position outside of the tracked range.
    pub const NOT_EXISTENT: EntryWithStatus = EntryWithStatus {
        status: SlotStatus::NotExistent,
        entry: None,
    };
}

/// A filled position map entry enriched with its global position, as produced by range scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "borsh", derive(BorshSerialize, BorshDeserialize))]
pub struct CollectionPositionEntry {
    pub position: u64,
    pub page: u64,
    pub offset: u32,
    pub record_version: i32,
}

impl CollectionPositionEntry {
    pub fn new(position: u64, entry: PositionEntry) -> Self {
        CollectionPositionEntry {
            position,
            page: entry.page_index,
            offset: entry.record_position,
            record_version: entry.record_version,
        }
    }
}
