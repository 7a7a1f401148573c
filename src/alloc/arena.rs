//! # Arena Allocator
//!
//! The arena owns a [`Backend`] and parcels its bytes out as [`Section`]s.
//! Reclaimed ranges are served from the [`FreeList`] first; everything else
//! is bump-allocated from the logical tail, growing the backend when the
//! tail passes capacity.
//!
//! ## Trunk Record
//!
//! The first [`TRUNK_SIZE`] bytes of every arena hold the trunk — the only
//! fixed-address record:
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  -----------------------------------------
//! 0       8     root: offset of the tree's root block (-1 = empty)
//! 8       8     tail: first unallocated byte
//! 16      8     cap: arena capacity at last resolve
//! 24      8     count: number of live blocks
//! ```
//!
//! `tail == 0` is the "fresh arena" marker: a newly created (or zero-filled)
//! backing region reads as uninitialized, and opening it writes the initial
//! trunk. All fields are little-endian and read/written through explicit
//! [`zerocopy`] (de)serialization, so nothing depends on host struct layout.
//!
//! ## Offsets, Not Pointers
//!
//! A grow can move the whole byte region, so the arena never hands out
//! anything that survives one — `bytes()`/`bytes_mut()` borrow the arena and
//! are re-fetched by callers after any allocating call. Every stored
//! reference between records is an `i64` offset with `-1` as null.

use eyre::{ensure, Result};
use zerocopy::little_endian::I64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::StoreError;
use crate::storage::Backend;

use super::{FreeList, Section};

/// Size of the trunk record at arena offset 0.
pub const TRUNK_SIZE: i64 = 32;

/// The fixed-offset arena header.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Trunk {
    root: I64,
    tail: I64,
    cap: I64,
    count: I64,
}

const _: () = assert!(std::mem::size_of::<Trunk>() == TRUNK_SIZE as usize);

impl Trunk {
    fn fresh(cap: i64) -> Self {
        Self {
            root: I64::new(-1),
            tail: I64::new(TRUNK_SIZE),
            cap: I64::new(cap),
            count: I64::new(0),
        }
    }

    /// Offset of the root block, `-1` when the tree is empty.
    pub fn root(&self) -> i64 {
        self.root.get()
    }

    /// First unallocated byte.
    pub fn tail(&self) -> i64 {
        self.tail.get()
    }

    /// Capacity recorded at the last resolve.
    pub fn cap(&self) -> i64 {
        self.cap.get()
    }

    /// Number of live blocks.
    pub fn count(&self) -> i64 {
        self.count.get()
    }
}

/// A byte-range allocator over a single backend.
#[derive(Debug)]
pub struct Arena<B> {
    backend: B,
    free: FreeList,
}

impl<B: Backend> Arena<B> {
    /// Opens an arena over `backend`, sizing it to at least `capacity_hint`
    /// and writing the initial trunk when the region is fresh.
    pub fn open(mut backend: B, capacity_hint: i64) -> Result<Self> {
        backend.grow(capacity_hint.max(TRUNK_SIZE))?;

        let mut arena = Self {
            backend,
            free: FreeList::new(),
        };

        let mut trunk = arena.trunk()?;
        if trunk.tail() == 0 {
            trunk = Trunk::fresh(arena.backend.capacity());
        } else {
            trunk.cap = I64::new(arena.backend.capacity());
        }
        arena.set_trunk(&trunk)?;

        Ok(arena)
    }

    /// Reads the trunk record.
    pub fn trunk(&self) -> Result<Trunk> {
        let view = self.backend.view()?;
        ensure!(
            view.len() >= TRUNK_SIZE as usize,
            StoreError::corruption(format!(
                "arena of {} bytes cannot hold a trunk record",
                view.len()
            ))
        );

        Trunk::read_from_bytes(&view[..TRUNK_SIZE as usize])
            .map_err(|_| StoreError::corruption("trunk record is unreadable").into())
    }

    fn set_trunk(&mut self, trunk: &Trunk) -> Result<()> {
        let view = self.backend.view_mut()?;
        ensure!(
            view.len() >= TRUNK_SIZE as usize,
            StoreError::corruption("arena too small for trunk write")
        );

        view[..TRUNK_SIZE as usize].copy_from_slice(trunk.as_bytes());
        Ok(())
    }

    /// Stores the root block offset.
    pub fn set_root(&mut self, root: i64) -> Result<()> {
        let mut trunk = self.trunk()?;
        trunk.root = I64::new(root);
        self.set_trunk(&trunk)
    }

    /// Stores the live-block count.
    pub fn set_count(&mut self, count: i64) -> Result<()> {
        let mut trunk = self.trunk()?;
        trunk.count = I64::new(count);
        self.set_trunk(&trunk)
    }

    /// Hands out a section of `size` bytes: free list first, bump otherwise.
    /// Returns the section and whether the backend had to regrow, in which
    /// case previously fetched views are stale.
    pub fn allocate(&mut self, size: i64) -> Result<(Section, bool)> {
        ensure!(size > 0, "allocation size must be positive, got {size}");

        if let Some(offset) = self.free.acquire(size) {
            return Ok((Section::new(offset, size), false));
        }

        let mut trunk = self.trunk()?;
        let offset = trunk.tail();
        trunk.tail = I64::new(offset + size);

        let grew = self.backend.grow(trunk.tail())?;
        trunk.cap = I64::new(self.backend.capacity());
        self.set_trunk(&trunk)?;

        Ok((Section::new(offset, size), grew))
    }

    /// Returns a section to the free list, zeroing its bytes. Empty sections
    /// are ignored.
    pub fn release(&mut self, section: Section) -> Result<()> {
        if section.is_empty() {
            return Ok(());
        }

        self.bytes_mut(section.offset, section.size)?.fill(0);
        self.free.release(section);

        tracing::trace!(
            offset = section.offset,
            size = section.size,
            free_ranges = self.free.len(),
            "released section"
        );
        Ok(())
    }

    /// Grows raw capacity until it exceeds `min`, independent of allocation.
    pub fn grow(&mut self, min: i64) -> Result<bool> {
        let grew = self.backend.grow(min)?;
        if grew {
            let mut trunk = self.trunk()?;
            trunk.cap = I64::new(self.backend.capacity());
            self.set_trunk(&trunk)?;
        }

        Ok(grew)
    }

    /// Pushes the tail out to at least `size`, growing capacity to match.
    pub fn ensure_size(&mut self, size: i64) -> Result<bool> {
        let mut trunk = self.trunk()?;
        if trunk.tail() >= size {
            return Ok(false);
        }

        trunk.tail = I64::new(size);
        self.set_trunk(&trunk)?;
        self.grow(size)
    }

    /// Resets the arena to empty: tail back to the trunk boundary, free list
    /// cleared. The backend keeps its capacity.
    pub fn reset(&mut self) -> Result<()> {
        let mut trunk = self.trunk()?;
        trunk.root = I64::new(-1);
        trunk.tail = I64::new(TRUNK_SIZE);
        trunk.count = I64::new(0);
        self.set_trunk(&trunk)?;
        self.free.clear();
        Ok(())
    }

    /// Bytes in use past the trunk.
    pub fn len(&self) -> Result<i64> {
        Ok(self.trunk()?.tail() - TRUNK_SIZE)
    }

    /// Current backend capacity.
    pub fn capacity(&self) -> i64 {
        self.backend.capacity()
    }

    /// Borrows `size` bytes at `offset`, checking the range against the
    /// arena. An out-of-range request is a corruption error, not a panic.
    pub fn bytes(&self, offset: i64, size: i64) -> Result<&[u8]> {
        let view = self.backend.view()?;
        check_range(offset, size, view.len())?;
        Ok(&view[offset as usize..(offset + size) as usize])
    }

    /// Mutable counterpart of [`Arena::bytes`].
    pub fn bytes_mut(&mut self, offset: i64, size: i64) -> Result<&mut [u8]> {
        let view = self.backend.view_mut()?;
        check_range(offset, size, view.len())?;
        Ok(&mut view[offset as usize..(offset + size) as usize])
    }

    /// Flushes the backend.
    pub fn sync(&mut self) -> Result<()> {
        self.backend.sync()
    }

    /// Closes the backend. Double-close is an error.
    pub fn close(&mut self) -> Result<()> {
        self.backend.close()
    }

    #[cfg(test)]
    pub(crate) fn free_ranges(&self) -> usize {
        self.free.len()
    }
}

fn check_range(offset: i64, size: i64, len: usize) -> Result<()> {
    ensure!(
        offset >= 0 && size >= 0 && (offset + size) as usize <= len,
        StoreError::corruption(format!(
            "range [{offset}, {}) escapes arena of {len} bytes",
            offset + size
        ))
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::HeapBackend;

    fn arena(cap: i64) -> Arena<HeapBackend> {
        Arena::open(HeapBackend::with_capacity(cap), cap).unwrap()
    }

    #[test]
    fn open_initializes_a_fresh_trunk() {
        let a = arena(128);
        let trunk = a.trunk().unwrap();

        assert_eq!(trunk.root(), -1);
        assert_eq!(trunk.tail(), TRUNK_SIZE);
        assert_eq!(trunk.count(), 0);
        assert_eq!(trunk.cap(), a.capacity());
    }

    #[test]
    fn allocate_bumps_from_the_tail() {
        let mut a = arena(128);

        let (first, _) = a.allocate(16).unwrap();
        let (second, _) = a.allocate(16).unwrap();

        assert_eq!(first, Section::new(TRUNK_SIZE, 16));
        assert_eq!(second, Section::new(TRUNK_SIZE + 16, 16));
        assert_eq!(a.trunk().unwrap().tail(), TRUNK_SIZE + 32);
    }

    #[test]
    fn allocate_past_capacity_grows_the_backend() {
        let mut a = arena(64);

        let (_, grew_small) = a.allocate(16).unwrap();
        let (section, grew) = a.allocate(256).unwrap();

        assert!(!grew_small);
        assert!(grew);
        assert_eq!(section.offset, TRUNK_SIZE + 16);
        assert!(a.capacity() > section.end());
    }

    #[test]
    fn released_section_is_reused_without_growth() {
        let mut a = arena(256);

        let (section, _) = a.allocate(64).unwrap();
        a.release(section).unwrap();
        let cap_before = a.capacity();
        let (again, grew) = a.allocate(64).unwrap();

        assert_eq!(again.offset, section.offset);
        assert!(!grew);
        assert_eq!(a.capacity(), cap_before);
    }

    #[test]
    fn release_zeroes_the_range() {
        let mut a = arena(256);
        let (section, _) = a.allocate(8).unwrap();
        a.bytes_mut(section.offset, 8).unwrap().fill(0xFF);

        a.release(section).unwrap();

        assert_eq!(a.bytes(section.offset, 8).unwrap(), &[0u8; 8]);
    }

    #[test]
    fn adjacent_releases_serve_the_combined_span() {
        let mut a = arena(256);
        let (first, _) = a.allocate(32).unwrap();
        let (second, _) = a.allocate(32).unwrap();

        a.release(second).unwrap();
        a.release(first).unwrap();
        let cap_before = a.capacity();
        let (combined, grew) = a.allocate(64).unwrap();

        assert_eq!(combined.offset, first.offset);
        assert!(!grew);
        assert_eq!(a.capacity(), cap_before);
        assert_eq!(a.free_ranges(), 0);
    }

    #[test]
    fn trunk_survives_growth() {
        let mut a = arena(64);
        a.set_root(1234).unwrap();

        a.allocate(4096).unwrap();

        assert_eq!(a.trunk().unwrap().root(), 1234);
        assert_eq!(a.trunk().unwrap().cap(), a.capacity());
    }

    #[test]
    fn out_of_range_access_is_corruption() {
        let a = arena(64);

        let err = a.bytes(1 << 20, 8).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Corruption { .. })
        ));
    }

    #[test]
    fn reset_returns_the_arena_to_fresh_state() {
        let mut a = arena(128);
        a.allocate(32).unwrap();
        a.set_root(64).unwrap();
        a.set_count(3).unwrap();

        a.reset().unwrap();
        let trunk = a.trunk().unwrap();

        assert_eq!(trunk.root(), -1);
        assert_eq!(trunk.tail(), TRUNK_SIZE);
        assert_eq!(trunk.count(), 0);
    }
}
