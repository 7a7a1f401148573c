//! # Tanoak - Arena-Backed Red-Black Tree Storage
//!
//! Tanoak is an embedded, durable key-value store built around a red-black
//! tree whose nodes live at byte offsets inside a growable, optionally
//! memory-mapped arena — no language-level pointers, only re-resolvable
//! offsets, so the whole structure survives arena growth and maps straight
//! off disk.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tanoak::Store;
//!
//! let store = Store::open_mapped("./data", "store.tdb", 1024)?;
//!
//! store.update(|txn| {
//!     txn.put(b"greeting", b"hello")?;
//!     let mut bucket = txn.create_bucket(b"users")?;
//!     bucket.put(b"name", b"amy")
//! })?;
//!
//! store.read(|txn| {
//!     assert_eq!(txn.get(b"greeting")?, Some(&b"hello"[..]));
//!     Ok(())
//! })?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │       Store / Txn / Bucket            │  transactions, nested namespaces
//! ├───────────────────────────────────────┤
//! │       Tree (red-black, offsets)       │  insert/delete rebalance, blobs
//! ├───────────────────────────────────────┤
//! │       Arena (bump + free list)        │  sections, trunk header
//! ├───────────────────────────────────────┤
//! │       Backend (heap / mmap)           │  growable byte region
//! └───────────────────────────────────────┘
//! ```
//!
//! - [`storage`]: byte backends with doubling growth and grow-transparency
//! - [`alloc`]: section allocation, first-fit free list with coalescing
//! - [`tree`]: the offset-addressed red-black tree, blob reference counts,
//!   checkouts
//! - [`store`]: the locking façade, transactions, buckets, commit merge
//!
//! ## Concurrency
//!
//! Single writer, many readers: update transactions serialize behind a
//! writer lock, read transactions share a reader lock. All calls are
//! synchronous and blocking; there is no internal task scheduling.
//!
//! ## Durability
//!
//! The memory-mapped variant persists the arena as a single file whose first
//! 32 bytes are the trunk record. There is no write-ahead log and no
//! checksumming: torn writes on crash are tolerated by design.

pub mod alloc;
pub mod error;
pub mod storage;
pub mod store;
pub mod tree;

pub use error::StoreError;
pub use storage::{Backend, HeapBackend, MmapBackend};
pub use store::{Bucket, Store, Txn, BUCKET_MARKER};
pub use tree::{Checkout, Tree};
