//! # Allocation Module
//!
//! Byte-range allocation on top of a [`Backend`](crate::storage::Backend).
//! The arena hands out [`Section`]s — `(offset, size)` descriptors — via a
//! bump pointer for first-time growth and a free list for reclaimed ranges.
//!
//! ## Layout
//!
//! ```text
//! offset 0         TRUNK_SIZE                         tail          cap
//! +----------------+----------------------------------+-------------+
//! | Trunk (32B)    | blocks and blobs                 | unallocated |
//! +----------------+----------------------------------+-------------+
//! ```
//!
//! The trunk is the only record with a fixed address. Everything else is
//! reached by offsets stored in other records, starting from the trunk's
//! root offset.
//!
//! ## Module Organization
//!
//! - `section`: the `(offset, size)` range descriptor
//! - `freelist`: ordered free ranges with first-fit acquire and adjacency
//!   coalescing on release
//! - `arena`: the allocator itself plus the trunk header record

mod arena;
mod freelist;
mod section;

pub use arena::{Arena, Trunk, TRUNK_SIZE};
pub use freelist::FreeList;
pub use section::Section;
