//! # Storage Module
//!
//! The byte backends underneath the arena. A backend owns a single contiguous
//! byte sequence — either a growable heap buffer or a memory-mapped file —
//! and everything above it holds *offsets* into that sequence, never
//! addresses.
//!
//! ## Growth Model
//!
//! `grow(min)` is the only way capacity changes. It uses a doubling strategy
//! (capacity doubles until it exceeds the requested minimum) so that offset
//! arithmetic computed before a grow remains valid after it: bytes keep their
//! offsets, only the base address moves. Any view obtained before a grow is
//! invalid afterwards.
//!
//! ## Safety Model
//!
//! Growth can move the whole region, so holding a reference across a grow
//! would dangle. The API leans on the borrow checker instead of runtime
//! guards:
//!
//! ```text
//! view(&self) -> &[u8]          // immutable borrow of self
//! view_mut(&mut self) -> &mut [u8]
//! grow(&mut self)               // exclusive borrow
//! ```
//!
//! Since `grow()` requires `&mut self`, no view can be live when the region
//! moves. Callers therefore re-fetch the view after every operation that may
//! have grown the backend, rather than caching it.
//!
//! ## Lifecycle
//!
//! `close()` flushes and releases the resources behind the backend. Closing
//! twice is an `AlreadyClosed` error, never a crash; every other operation on
//! a closed backend fails the same way.

mod heap;
mod mmap;

pub use heap::HeapBackend;
pub use mmap::MmapBackend;

use eyre::Result;

/// Smallest capacity a backend will size itself to.
pub const MIN_CAPACITY: i64 = 32;

/// A growable byte sequence owner.
///
/// Implementations guarantee that `grow` preserves all previously written
/// bytes at their existing offsets and that capacity strictly exceeds the
/// requested minimum afterwards.
pub trait Backend {
    /// Grows capacity until it exceeds `min`, doubling from the current
    /// capacity. Returns whether a regrow actually happened; `false` means
    /// every previously fetched view is still valid.
    fn grow(&mut self, min: i64) -> Result<bool>;

    /// Current capacity in bytes.
    fn capacity(&self) -> i64;

    /// The full byte region.
    fn view(&self) -> Result<&[u8]>;

    /// The full byte region, writable.
    fn view_mut(&mut self) -> Result<&mut [u8]>;

    /// Flushes written bytes to the underlying medium.
    fn sync(&mut self) -> Result<()>;

    /// Flushes and releases resources. Double-close is an error.
    fn close(&mut self) -> Result<()>;
}
