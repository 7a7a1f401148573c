//! # Block and Blob Layout
//!
//! Fixed-width binary records for tree nodes. Blocks are never reinterpreted
//! in place; they are read into owned copies and written back through
//! explicit [`zerocopy`] (de)serialization, so nothing depends on host struct
//! layout or alignment and copies stay valid across arena growth.
//!
//! ## Block Record (64 bytes)
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  --------------------------------------------
//! 0       1     color: 0 = black, 1 = red, 2 = double-black
//! 1       1     child type: 0 = root, 1 = left, 2 = right
//! 2       6     reserved
//! 8       8     offset: the block's own arena offset
//! 16      8     blob_offset: start of the key/value blob (-1 = none)
//! 24      8     parent: parent block offset (-1 = none)
//! 32      8     left: left child offset (-1 = none)
//! 40      8     right: right child offset (-1 = none)
//! 48      8     key_len: stored key length (immutable once created)
//! 56      8     val_len: stored value length
//! ```
//!
//! ## Blob Layout
//!
//! ```text
//! blob_offset:      8-byte reference counter (little-endian)
//! blob_offset + 8:  key bytes (key_len)
//! then:             value bytes (val_len)
//! ```
//!
//! The counter is created at 1; a checkout that shares the blob increments
//! it, and the blob's full range (counter + key + value) returns to the
//! allocator when the count reaches zero.

use eyre::Result;
use zerocopy::little_endian::I64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::StoreError;

/// Size of a block record.
pub(crate) const BLOCK_SIZE: i64 = 64;

/// Size of the counter prefixed to every blob.
pub(crate) const REFCOUNT_SIZE: i64 = 8;

/// Node color, including the transient deletion marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Color {
    Black,
    Red,
    /// Transient marker for a black-height deficit during delete rebalance.
    DoubleBlack,
}

impl Color {
    fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Color::Black),
            1 => Ok(Color::Red),
            2 => Ok(Color::DoubleBlack),
            other => Err(StoreError::corruption(format!("unknown color byte {other}")).into()),
        }
    }

    fn raw(self) -> u8 {
        match self {
            Color::Black => 0,
            Color::Red => 1,
            Color::DoubleBlack => 2,
        }
    }
}

/// Which slot of its parent a block occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildType {
    Root,
    Left,
    Right,
}

impl ChildType {
    fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(ChildType::Root),
            1 => Ok(ChildType::Left),
            2 => Ok(ChildType::Right),
            other => Err(StoreError::corruption(format!("unknown child type byte {other}")).into()),
        }
    }

    fn raw(self) -> u8 {
        match self {
            ChildType::Root => 0,
            ChildType::Left => 1,
            ChildType::Right => 2,
        }
    }
}

/// A tree node record. Always handled as an owned copy of its arena bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct Block {
    color: u8,
    child_type: u8,
    reserved: [u8; 6],
    offset: I64,
    blob_offset: I64,
    parent: I64,
    left: I64,
    right: I64,
    key_len: I64,
    val_len: I64,
}

const _: () = assert!(std::mem::size_of::<Block>() == BLOCK_SIZE as usize);

impl Block {
    /// A detached red block with no blob, parent, or children.
    pub fn new_red(offset: i64, key_len: i64) -> Self {
        Self {
            color: Color::Red.raw(),
            child_type: ChildType::Root.raw(),
            reserved: [0u8; 6],
            offset: I64::new(offset),
            blob_offset: I64::new(-1),
            parent: I64::new(-1),
            left: I64::new(-1),
            right: I64::new(-1),
            key_len: I64::new(key_len),
            val_len: I64::new(0),
        }
    }

    pub fn read(raw: &[u8]) -> Result<Self> {
        Self::read_from_bytes(raw)
            .map_err(|_| StoreError::corruption("block record is unreadable").into())
    }

    pub fn color(&self) -> Result<Color> {
        Color::from_raw(self.color)
    }

    pub fn set_color(&mut self, color: Color) {
        self.color = color.raw();
    }

    pub fn child_type(&self) -> Result<ChildType> {
        ChildType::from_raw(self.child_type)
    }

    pub fn set_child_type(&mut self, ct: ChildType) {
        self.child_type = ct.raw();
    }

    pub fn offset(&self) -> i64 {
        self.offset.get()
    }

    pub fn set_offset(&mut self, offset: i64) {
        self.offset = I64::new(offset);
    }

    pub fn blob_offset(&self) -> i64 {
        self.blob_offset.get()
    }

    pub fn set_blob_offset(&mut self, offset: i64) {
        self.blob_offset = I64::new(offset);
    }

    pub fn parent(&self) -> i64 {
        self.parent.get()
    }

    pub fn set_parent(&mut self, offset: i64) {
        self.parent = I64::new(offset);
    }

    pub fn left(&self) -> i64 {
        self.left.get()
    }

    pub fn set_left(&mut self, offset: i64) {
        self.left = I64::new(offset);
    }

    pub fn right(&self) -> i64 {
        self.right.get()
    }

    pub fn set_right(&mut self, offset: i64) {
        self.right = I64::new(offset);
    }

    /// The child slot named by `side` (`Left` or `Right`).
    pub fn child(&self, side: ChildType) -> i64 {
        match side {
            ChildType::Left => self.left(),
            _ => self.right(),
        }
    }

    pub fn key_len(&self) -> i64 {
        self.key_len.get()
    }

    pub fn val_len(&self) -> i64 {
        self.val_len.get()
    }

    pub fn set_val_len(&mut self, len: i64) {
        self.val_len = I64::new(len);
    }

    /// Arena offset of the key bytes inside this block's blob.
    pub fn key_at(&self) -> i64 {
        self.blob_offset() + REFCOUNT_SIZE
    }

    /// Arena offset of the value bytes inside this block's blob.
    pub fn value_at(&self) -> i64 {
        self.blob_offset() + REFCOUNT_SIZE + self.key_len()
    }

    /// Full size of this block's blob, counter included.
    pub fn blob_size(&self) -> i64 {
        REFCOUNT_SIZE + self.key_len() + self.val_len()
    }
}
