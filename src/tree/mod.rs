//! # Tree Module
//!
//! The offset-addressed red-black tree. Every node ("block") is a fixed
//! 64-byte record at its own arena offset; keys and values live in
//! variable-length blobs referenced by offset and length from the owning
//! block. All linkage between records is by `i64` offset with `-1` as null,
//! so the whole structure survives arena growth untouched — only the base
//! address moves.
//!
//! ## Working Copies
//!
//! Blocks are read into owned 64-byte copies, mutated, and written back.
//! Copies stay valid across any allocation, which removes the original
//! design's obligation to re-resolve node pointers after every potential
//! grow; only *byte views* (keys, values) are re-fetched from the arena at
//! the point of use.
//!
//! ## Module Organization
//!
//! - `layout`: the block record, colors, child types, blob geometry
//! - `tree`: the tree proper — insert/delete rebalancing, iteration,
//!   value growth, checkouts
//! - `image`: read-only tree views over raw bytes, used for bucket values

mod image;
mod layout;
#[allow(clippy::module_inception)]
mod tree;

pub(crate) use image::TreeImage;
pub(crate) use layout::{Block, ChildType, Color, BLOCK_SIZE, REFCOUNT_SIZE};
pub use tree::{Checkout, Tree};
