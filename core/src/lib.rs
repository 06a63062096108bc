//! Core page layouts of the record-location index.
//!
//! This crate defines the byte-level representation of every page kept by the index in a
//! storage-agnostic manner: the buckets and the entry point of a collection position map, and
//! the segment-tree pages of a free-space map. Nothing here performs I/O; every layout is a
//! view over a borrowed page-sized byte slice.
//!
//! The layouts do not require the standard library.

#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

pub mod bucket;
pub mod entry_point;
pub mod fsm_page;
pub mod page;
pub mod position;

pub use page::{Page, PAGE_SIZE};
pub use position::{CollectionPositionEntry, EntryWithStatus, PositionEntry, SlotStatus};
