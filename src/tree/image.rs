//! Read-only tree views over raw arena bytes.
//!
//! A bucket's backing bytes are a value blob holding a complete serialized
//! arena — trunk at image offset 0, blocks and blobs after it. `TreeImage`
//! walks such bytes in place without copying them into a live tree, which is
//! how bucket reads and the commit-time merge consume embedded trees.
//!
//! Uninitialized bytes (all zeros, or shorter than a trunk) read as an empty
//! tree; structurally damaged bytes surface as corruption errors.

use eyre::{ensure, Result};

use crate::alloc::{Trunk, TRUNK_SIZE};
use crate::error::StoreError;

use super::{Block, BLOCK_SIZE};

use zerocopy::FromBytes;

/// A read-only tree over a borrowed arena image.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TreeImage<'a> {
    bytes: &'a [u8],
}

impl<'a> TreeImage<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn trunk(&self) -> Result<Option<Trunk>> {
        if self.bytes.len() < TRUNK_SIZE as usize {
            return Ok(None);
        }

        let trunk = Trunk::read_from_bytes(&self.bytes[..TRUNK_SIZE as usize])
            .map_err(|_| StoreError::corruption("image trunk is unreadable"))?;

        if trunk.tail() == 0 {
            return Ok(None);
        }

        Ok(Some(trunk))
    }

    fn slice(&self, offset: i64, size: i64) -> Result<&'a [u8]> {
        ensure!(
            offset >= 0 && size >= 0 && (offset + size) as usize <= self.bytes.len(),
            StoreError::corruption(format!(
                "image range [{offset}, {}) escapes {} bytes",
                offset + size,
                self.bytes.len()
            ))
        );

        Ok(&self.bytes[offset as usize..(offset + size) as usize])
    }

    fn block(&self, offset: i64) -> Result<Block> {
        Block::read(self.slice(offset, BLOCK_SIZE)?)
    }

    fn key_of(&self, block: &Block) -> Result<&'a [u8]> {
        ensure!(
            block.blob_offset() >= 0,
            StoreError::corruption(format!("image block at {} has no blob", block.offset()))
        );
        self.slice(block.key_at(), block.key_len())
    }

    fn value_of(&self, block: &Block) -> Result<&'a [u8]> {
        ensure!(
            block.blob_offset() >= 0,
            StoreError::corruption(format!("image block at {} has no blob", block.offset()))
        );
        self.slice(block.value_at(), block.val_len())
    }

    /// Number of keys recorded in the image.
    pub fn len(&self) -> Result<i64> {
        Ok(self.trunk()?.map_or(0, |t| t.count()))
    }

    /// Retrieves the value stored for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<&'a [u8]>> {
        let Some(trunk) = self.trunk()? else {
            return Ok(None);
        };

        let mut current = trunk.root();
        while current != -1 {
            let b = self.block(current)?;
            current = match key.cmp(self.key_of(&b)?) {
                std::cmp::Ordering::Equal => return Ok(Some(self.value_of(&b)?)),
                std::cmp::Ordering::Less => b.left(),
                std::cmp::Ordering::Greater => b.right(),
            };
        }

        Ok(None)
    }

    /// In-order traversal with early termination, mirroring
    /// [`Tree::for_each`](super::Tree::for_each).
    pub fn for_each<F>(&self, mut visit: F) -> Result<bool>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let Some(trunk) = self.trunk()? else {
            return Ok(false);
        };

        if trunk.root() == -1 {
            return Ok(false);
        }

        self.iterate(trunk.root(), &mut visit)
    }

    fn iterate<F>(&self, offset: i64, visit: &mut F) -> Result<bool>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let b = self.block(offset)?;

        if b.left() != -1 && self.iterate(b.left(), visit)? {
            return Ok(true);
        }

        if visit(self.key_of(&b)?, self.value_of(&b)?) {
            return Ok(true);
        }

        if b.right() != -1 && self.iterate(b.right(), visit)? {
            return Ok(true);
        }

        Ok(false)
    }
}
