//! The red-black tree over an arena.
//!
//! Key comparison is byte-wise lexicographic on the raw key bytes. Inserts
//! run the classic red-uncle/triangle/line rebalance from the touched block
//! upward; deletes run the canonical double-black rebalance, case-split on
//! the sibling's color and the sibling's children. Rotations are pure offset
//! rewrites — no record ever moves once allocated.

use eyre::{ensure, Result};
use zerocopy::little_endian::I64;
use zerocopy::{FromBytes, IntoBytes};

use crate::alloc::{Arena, Section};
use crate::error::StoreError;
use crate::storage::{Backend, HeapBackend, MmapBackend};

use super::{Block, ChildType, Color, BLOCK_SIZE, REFCOUNT_SIZE};

/// A duplicate of a tree's block graph rooted at its own offset, sharing
/// blobs with the source through reference counts. All operations go through
/// the owning [`Tree`].
#[derive(Debug)]
pub struct Checkout {
    root: i64,
    count: i64,
}

impl Checkout {
    /// Number of keys visible through this checkout.
    pub fn len(&self) -> i64 {
        self.count
    }

    /// Whether the checkout holds no keys.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// A red-black tree whose nodes live at byte offsets inside one arena.
#[derive(Debug)]
pub struct Tree<B> {
    arena: Arena<B>,
}

impl Tree<HeapBackend> {
    /// Returns a tree over a fresh in-memory arena.
    pub fn heap(capacity_hint: i64) -> Result<Self> {
        Self::open(HeapBackend::with_capacity(capacity_hint), capacity_hint)
    }

    /// Returns a heap tree seeded from a serialized arena image.
    pub fn from_image(image: &[u8]) -> Result<Self> {
        let len = image.len() as i64;
        let mut backend = HeapBackend::with_capacity(len);
        backend.view_mut()?[..image.len()].copy_from_slice(image);
        Self::open(backend, len)
    }
}

impl Tree<MmapBackend> {
    /// Returns a tree over a memory-mapped arena file at `dir/name`.
    pub fn mapped(
        dir: impl AsRef<std::path::Path>,
        name: impl AsRef<std::path::Path>,
        capacity_hint: i64,
    ) -> Result<Self> {
        Self::open(MmapBackend::open(dir, name)?, capacity_hint)
    }
}

impl<B: Backend> Tree<B> {
    /// Opens a tree over the provided backend, initializing the trunk when
    /// the arena is fresh.
    pub fn open(backend: B, capacity_hint: i64) -> Result<Self> {
        Ok(Self {
            arena: Arena::open(backend, capacity_hint)?,
        })
    }

    /// Retrieves the stored value for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        let root = self.arena.trunk()?.root();
        self.get_from(root, key)
    }

    /// Inserts or overwrites the value for `key`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let trunk = self.arena.trunk()?;
        let (root, created) = self.put_root(trunk.root(), key, value)?;

        self.arena.set_root(root)?;
        if created {
            self.arena.set_count(trunk.count() + 1)?;
        }
        Ok(())
    }

    /// Removes `key`. Absent keys are a no-op.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let trunk = self.arena.trunk()?;
        let (root, removed) = self.delete_root(trunk.root(), key)?;

        self.arena.set_root(root)?;
        if removed {
            self.arena.set_count(trunk.count() - 1)?;
        }
        Ok(())
    }

    /// In-order traversal. `visit` returning `true` cuts iteration short;
    /// the return value reports whether that happened.
    pub fn for_each<F>(&self, mut visit: F) -> Result<bool>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let root = self.arena.trunk()?.root();
        if root == -1 {
            return Ok(false);
        }

        self.iterate(root, &mut visit)
    }

    /// Ensures the stored value for `key` spans at least `min_size` bytes,
    /// zero-padding fresh bytes, and returns the full value view. Creates
    /// the key when absent.
    pub fn grow_value(&mut self, key: &[u8], min_size: i64) -> Result<&mut [u8]> {
        ensure!(min_size >= 0, "value size must be non-negative, got {min_size}");

        let trunk = self.arena.trunk()?;
        let (offset, created) = if trunk.root() == -1 {
            (self.new_block(key, -1, ChildType::Root)?, true)
        } else {
            self.seek_or_create(trunk.root(), key)?
        };

        self.grow_blob(offset, key, min_size)?;
        self.balance(offset)?;

        let root = self.derive_root(offset)?;
        self.arena.set_root(root)?;
        if created {
            self.arena.set_count(trunk.count() + 1)?;
        }

        let b = self.block(offset)?;
        self.arena.bytes_mut(b.value_at(), b.val_len())
    }

    /// The smallest key and its value, or `None` on an empty tree.
    pub fn first(&self) -> Result<Option<(&[u8], &[u8])>> {
        let root = self.arena.trunk()?.root();
        if root == -1 {
            return Ok(None);
        }

        let b = self.block(self.head_of(root)?)?;
        Ok(Some((self.key_of(&b)?, self.value_of(&b)?)))
    }

    /// The largest key and its value, or `None` on an empty tree.
    pub fn last(&self) -> Result<Option<(&[u8], &[u8])>> {
        let root = self.arena.trunk()?.root();
        if root == -1 {
            return Ok(None);
        }

        let b = self.block(self.tail_of(root)?)?;
        Ok(Some((self.key_of(&b)?, self.value_of(&b)?)))
    }

    /// Number of keys stored.
    pub fn len(&self) -> Result<i64> {
        Ok(self.arena.trunk()?.count())
    }

    /// Whether no keys are stored.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Clears the tree while keeping the arena and backend, so it can serve
    /// as a fresh store.
    pub fn reset(&mut self) -> Result<()> {
        self.arena.reset()
    }

    /// The serialized arena bytes, trunk included. A valid input for
    /// [`Tree::from_image`] and [`super::TreeImage`].
    pub fn image(&self) -> Result<&[u8]> {
        let tail = self.arena.trunk()?.tail();
        self.arena.bytes(0, tail)
    }

    /// Flushes the backend.
    pub fn sync(&mut self) -> Result<()> {
        self.arena.sync()
    }

    /// Closes the backend without touching stored bytes.
    pub fn close(&mut self) -> Result<()> {
        self.arena.close()
    }

    /// Releases every reachable block and blob reference, then closes the
    /// backend.
    pub fn destroy(mut self) -> Result<()> {
        let root = self.arena.trunk()?.root();
        self.release_subtree(root)?;
        self.arena.reset()?;
        self.arena.close()
    }

    /// Number of trees currently sharing the blob stored for `key`.
    pub fn value_refs(&self, key: &[u8]) -> Result<Option<i64>> {
        let root = self.arena.trunk()?.root();
        let offset = self.find_from(root, key)?;
        if offset == -1 {
            return Ok(None);
        }

        let b = self.block(offset)?;
        if b.blob_offset() < 0 {
            return Ok(None);
        }

        Ok(Some(self.refcount(b.blob_offset())?))
    }

    /// Duplicates the block graph inside the same arena, sharing every blob
    /// through its reference counter.
    pub fn checkout(&mut self) -> Result<Checkout> {
        let trunk = self.arena.trunk()?;
        let root = self.copy_subtree(trunk.root(), -1, ChildType::Root)?;

        Ok(Checkout {
            root,
            count: trunk.count(),
        })
    }

    /// Retrieves `key` through a checkout.
    pub fn checkout_get(&self, checkout: &Checkout, key: &[u8]) -> Result<Option<&[u8]>> {
        self.get_from(checkout.root, key)
    }

    /// Inserts or overwrites `key` through a checkout. A shared blob is
    /// copied before the write, leaving the source tree untouched.
    pub fn checkout_put(&mut self, checkout: &mut Checkout, key: &[u8], value: &[u8]) -> Result<()> {
        let (root, created) = self.put_root(checkout.root, key, value)?;
        checkout.root = root;
        if created {
            checkout.count += 1;
        }
        Ok(())
    }

    /// Removes `key` through a checkout.
    pub fn checkout_delete(&mut self, checkout: &mut Checkout, key: &[u8]) -> Result<()> {
        let (root, removed) = self.delete_root(checkout.root, key)?;
        checkout.root = root;
        if removed {
            checkout.count -= 1;
        }
        Ok(())
    }

    /// Releases a checkout's blocks and blob references back to the arena.
    pub fn discard_checkout(&mut self, checkout: Checkout) -> Result<()> {
        self.release_subtree(checkout.root)
    }

    /// Verifies the structural invariants: root is black, no red block has a
    /// red child, every root-to-null path crosses the same number of black
    /// blocks, keys are in strict order, linkage is consistent, and the
    /// trunk count matches the live blocks. Returns a corruption error on
    /// the first violation.
    pub fn validate(&self) -> Result<()> {
        let trunk = self.arena.trunk()?;
        let root = trunk.root();

        if root == -1 {
            ensure!(
                trunk.count() == 0,
                StoreError::corruption(format!("empty tree with count {}", trunk.count()))
            );
            return Ok(());
        }

        let rb = self.block(root)?;
        ensure!(
            rb.color()? == Color::Black,
            StoreError::corruption("root block is not black")
        );
        ensure!(
            rb.child_type()? == ChildType::Root && rb.parent() == -1,
            StoreError::corruption("root block is not detached")
        );

        let (_, count) = self.validate_subtree(root, -1)?;
        ensure!(
            count == trunk.count(),
            StoreError::corruption(format!(
                "trunk count {} does not match {count} live blocks",
                trunk.count()
            ))
        );

        let mut prev: Option<Vec<u8>> = None;
        let mut ordered = true;
        self.for_each(|key, _| {
            if let Some(p) = prev.as_deref() {
                if p >= key {
                    ordered = false;
                    return true;
                }
            }
            prev = Some(key.to_vec());
            false
        })?;
        ensure!(
            ordered,
            StoreError::corruption("in-order traversal is not strictly ascending")
        );

        Ok(())
    }

    fn validate_subtree(&self, offset: i64, parent: i64) -> Result<(i64, i64)> {
        if offset == -1 {
            return Ok((1, 0));
        }

        let b = self.block(offset)?;
        ensure!(
            b.offset() == offset,
            StoreError::corruption(format!(
                "block at {offset} records its own offset as {}",
                b.offset()
            ))
        );
        ensure!(
            b.parent() == parent,
            StoreError::corruption(format!("block at {offset} has a broken parent link"))
        );

        let color = b.color()?;
        ensure!(
            color != Color::DoubleBlack,
            StoreError::corruption(format!("block at {offset} is double-black at rest"))
        );

        for (child, ct) in [(b.left(), ChildType::Left), (b.right(), ChildType::Right)] {
            if child == -1 {
                continue;
            }

            let cb = self.block(child)?;
            ensure!(
                cb.child_type()? == ct,
                StoreError::corruption(format!("block at {child} has a wrong child type"))
            );
            if color == Color::Red {
                ensure!(
                    cb.color()? != Color::Red,
                    StoreError::corruption(format!("red block at {offset} has a red child"))
                );
            }
        }

        let (left_bh, left_n) = self.validate_subtree(b.left(), offset)?;
        let (right_bh, right_n) = self.validate_subtree(b.right(), offset)?;
        ensure!(
            left_bh == right_bh,
            StoreError::corruption(format!("black-height mismatch under block at {offset}"))
        );

        let own = if color == Color::Black { 1 } else { 0 };
        Ok((left_bh + own, left_n + right_n + 1))
    }

    // ---- descent ----------------------------------------------------------

    fn block(&self, offset: i64) -> Result<Block> {
        ensure!(
            offset >= 0,
            StoreError::corruption(format!("block read at negative offset {offset}"))
        );

        Block::read(self.arena.bytes(offset, BLOCK_SIZE)?)
    }

    fn write_block(&mut self, block: &Block) -> Result<()> {
        let raw = self.arena.bytes_mut(block.offset(), BLOCK_SIZE)?;
        raw.copy_from_slice(block.as_bytes());
        Ok(())
    }

    fn key_of(&self, block: &Block) -> Result<&[u8]> {
        ensure!(
            block.blob_offset() >= 0,
            StoreError::corruption(format!("block at {} has no blob", block.offset()))
        );
        self.arena.bytes(block.key_at(), block.key_len())
    }

    fn value_of(&self, block: &Block) -> Result<&[u8]> {
        ensure!(
            block.blob_offset() >= 0,
            StoreError::corruption(format!("block at {} has no blob", block.offset()))
        );
        self.arena.bytes(block.value_at(), block.val_len())
    }

    fn get_from(&self, root: i64, key: &[u8]) -> Result<Option<&[u8]>> {
        let offset = self.find_from(root, key)?;
        if offset == -1 {
            return Ok(None);
        }

        let b = self.block(offset)?;
        Ok(Some(self.value_of(&b)?))
    }

    fn find_from(&self, root: i64, key: &[u8]) -> Result<i64> {
        let mut current = root;

        while current != -1 {
            let b = self.block(current)?;
            current = match key.cmp(self.key_of(&b)?) {
                std::cmp::Ordering::Equal => return Ok(current),
                std::cmp::Ordering::Less => b.left(),
                std::cmp::Ordering::Greater => b.right(),
            };
        }

        Ok(-1)
    }

    /// Descends from `root` to the block for `key`, creating a red leaf in
    /// the missing slot when the key is absent.
    fn seek_or_create(&mut self, root: i64, key: &[u8]) -> Result<(i64, bool)> {
        let mut current = root;

        loop {
            let mut b = self.block(current)?;
            let side = match key.cmp(self.key_of(&b)?) {
                std::cmp::Ordering::Equal => return Ok((current, false)),
                std::cmp::Ordering::Less => ChildType::Left,
                std::cmp::Ordering::Greater => ChildType::Right,
            };

            let child = b.child(side);
            if child != -1 {
                current = child;
                continue;
            }

            let offset = self.new_block(key, current, side)?;
            match side {
                ChildType::Left => b.set_left(offset),
                _ => b.set_right(offset),
            }
            self.write_block(&b)?;
            return Ok((offset, true));
        }
    }

    fn head_of(&self, start: i64) -> Result<i64> {
        let mut current = start;

        loop {
            let b = self.block(current)?;
            if b.left() == -1 {
                return Ok(current);
            }
            current = b.left();
        }
    }

    fn tail_of(&self, start: i64) -> Result<i64> {
        let mut current = start;

        loop {
            let b = self.block(current)?;
            if b.right() == -1 {
                return Ok(current);
            }
            current = b.right();
        }
    }

    /// Walks parent links from any live block up to the block whose child
    /// type is `Root`. Rotations can change which block that is, so the root
    /// is re-derived after every balance instead of trusted from before.
    fn derive_root(&self, hint: i64) -> Result<i64> {
        let mut current = hint;
        let mut steps = self.arena.len()? / BLOCK_SIZE + 2;

        loop {
            let b = self.block(current)?;
            if b.child_type()? == ChildType::Root {
                return Ok(current);
            }

            ensure!(
                b.parent() != -1 && steps > 0,
                StoreError::corruption(format!("parent chain from block {hint} never reaches root"))
            );
            current = b.parent();
            steps -= 1;
        }
    }

    // ---- allocation -------------------------------------------------------

    fn new_block(&mut self, key: &[u8], parent: i64, ct: ChildType) -> Result<i64> {
        let (section, _) = self.arena.allocate(BLOCK_SIZE)?;

        let mut b = Block::new_red(section.offset, key.len() as i64);
        b.set_parent(parent);
        b.set_child_type(ct);
        self.write_block(&b)?;

        Ok(section.offset)
    }

    fn new_blob(&mut self, key: &[u8], value: &[u8]) -> Result<i64> {
        let total = REFCOUNT_SIZE + (key.len() + value.len()) as i64;
        let (section, _) = self.arena.allocate(total)?;

        let raw = self.arena.bytes_mut(section.offset, total)?;
        raw[..REFCOUNT_SIZE as usize].copy_from_slice(I64::new(1).as_bytes());
        raw[REFCOUNT_SIZE as usize..REFCOUNT_SIZE as usize + key.len()].copy_from_slice(key);
        raw[REFCOUNT_SIZE as usize + key.len()..].copy_from_slice(value);

        Ok(section.offset)
    }

    /// Writes `value` for the block at `offset`. Same-size values overwrite
    /// in place when the blob is private; shared or resized blobs get a
    /// fresh allocation and the old reference is released.
    fn set_value(&mut self, offset: i64, key: &[u8], value: &[u8]) -> Result<()> {
        let mut b = self.block(offset)?;
        let val_len = value.len() as i64;

        if b.blob_offset() >= 0
            && val_len == b.val_len()
            && self.refcount(b.blob_offset())? == 1
        {
            self.arena
                .bytes_mut(b.value_at(), val_len)?
                .copy_from_slice(value);
            return Ok(());
        }

        let blob = self.new_blob(key, value)?;
        if b.blob_offset() >= 0 {
            self.release_blob(&b)?;
        }

        b.set_blob_offset(blob);
        b.set_val_len(val_len);
        self.write_block(&b)
    }

    /// Grows the block's value allocation to at least `min_size` bytes,
    /// doubling capacity and zero-padding the added tail. Shared blobs are
    /// copied first even when already large enough.
    fn grow_blob(&mut self, offset: i64, key: &[u8], min_size: i64) -> Result<()> {
        let mut b = self.block(offset)?;
        let shared = b.blob_offset() >= 0 && self.refcount(b.blob_offset())? > 1;

        if b.blob_offset() >= 0 && min_size <= b.val_len() && !shared {
            return Ok(());
        }

        let mut val_len = b.val_len();
        if val_len == 0 {
            val_len = min_size;
        }
        while val_len < min_size {
            val_len *= 2;
        }

        let old_value = if b.blob_offset() >= 0 {
            self.value_of(&b)?.to_vec()
        } else {
            Vec::new()
        };

        let total = REFCOUNT_SIZE + key.len() as i64 + val_len;
        let (section, _) = self.arena.allocate(total)?;

        let raw = self.arena.bytes_mut(section.offset, total)?;
        raw[..REFCOUNT_SIZE as usize].copy_from_slice(I64::new(1).as_bytes());
        raw[REFCOUNT_SIZE as usize..REFCOUNT_SIZE as usize + key.len()].copy_from_slice(key);
        let value_start = (REFCOUNT_SIZE as usize) + key.len();
        raw[value_start..value_start + old_value.len()].copy_from_slice(&old_value);
        raw[value_start + old_value.len()..].fill(0);

        if b.blob_offset() >= 0 {
            self.release_blob(&b)?;
        }

        b.set_blob_offset(section.offset);
        b.set_val_len(val_len);
        self.write_block(&b)
    }

    // ---- reference counting -----------------------------------------------

    fn refcount(&self, blob_offset: i64) -> Result<i64> {
        let raw = self.arena.bytes(blob_offset, REFCOUNT_SIZE)?;
        let count = I64::read_from_bytes(raw)
            .map_err(|_| StoreError::corruption("blob counter is unreadable"))?;
        Ok(count.get())
    }

    fn set_refcount(&mut self, blob_offset: i64, count: i64) -> Result<()> {
        self.arena
            .bytes_mut(blob_offset, REFCOUNT_SIZE)?
            .copy_from_slice(I64::new(count).as_bytes());
        Ok(())
    }

    fn acquire_blob(&mut self, blob_offset: i64) -> Result<()> {
        let count = self.refcount(blob_offset)?;
        self.set_refcount(blob_offset, count + 1)
    }

    /// Drops one reference to the block's blob, returning the full range
    /// (counter, key, value) to the arena when the last reference goes.
    fn release_blob(&mut self, block: &Block) -> Result<()> {
        if block.blob_offset() < 0 {
            return Ok(());
        }

        let count = self.refcount(block.blob_offset())? - 1;
        if count > 0 {
            return self.set_refcount(block.blob_offset(), count);
        }

        self.arena
            .release(Section::new(block.blob_offset(), block.blob_size()))
    }

    // ---- insert rebalance -------------------------------------------------

    fn uncle_of(&self, offset: i64) -> Result<i64> {
        let b = self.block(offset)?;
        if b.parent() == -1 {
            return Ok(-1);
        }

        let parent = self.block(b.parent())?;
        if parent.parent() == -1 {
            return Ok(-1);
        }

        let grandparent = self.block(parent.parent())?;
        Ok(match parent.child_type()? {
            ChildType::Left => grandparent.right(),
            ChildType::Right => grandparent.left(),
            ChildType::Root => -1,
        })
    }

    fn set_color_at(&mut self, offset: i64, color: Color) -> Result<()> {
        let mut b = self.block(offset)?;
        b.set_color(color);
        self.write_block(&b)
    }

    fn is_red(&self, offset: i64) -> Result<bool> {
        if offset == -1 {
            return Ok(false);
        }
        Ok(self.block(offset)?.color()? == Color::Red)
    }

    /// Restores the insert invariants, working from the touched block
    /// upward.
    fn balance(&mut self, offset: i64) -> Result<()> {
        let b = self.block(offset)?;

        if b.color()? == Color::Black {
            return Ok(());
        }

        if b.child_type()? == ChildType::Root {
            return self.set_color_at(offset, Color::Black);
        }

        let parent_off = b.parent();
        let parent = self.block(parent_off)?;
        let uncle_off = self.uncle_of(offset)?;

        if self.is_red(uncle_off)? {
            let grandparent_off = parent.parent();
            self.set_color_at(parent_off, Color::Black)?;
            self.set_color_at(uncle_off, Color::Black)?;
            self.set_color_at(grandparent_off, Color::Red)?;
            return self.balance(grandparent_off);
        }

        if parent.color()? == Color::Red {
            let grandparent_off = parent.parent();
            let triangle = matches!(
                (b.child_type()?, parent.child_type()?),
                (ChildType::Left, ChildType::Right) | (ChildType::Right, ChildType::Left)
            );

            if triangle {
                self.rotate_up(offset)?;
                return self.balance(parent_off);
            }

            self.rotate_up(parent_off)?;
            self.set_color_at(parent_off, Color::Black)?;
            self.set_color_at(grandparent_off, Color::Red)?;
            return self.balance(grandparent_off);
        }

        Ok(())
    }

    /// Rotates a block over its parent: a right child rotates left, a left
    /// child rotates right. Rewires the displaced inner child, the old
    /// grandparent link, and the child types of everything touched.
    fn rotate_up(&mut self, offset: i64) -> Result<()> {
        let mut b = self.block(offset)?;
        let ct = b.child_type()?;
        ensure!(
            ct != ChildType::Root,
            StoreError::corruption(format!("rotation of root block at {offset}"))
        );

        let parent_off = b.parent();
        let mut parent = self.block(parent_off)?;
        let grandparent_off = parent.parent();

        let swap = match ct {
            ChildType::Right => {
                let swap = b.left();
                b.set_left(parent_off);
                parent.set_right(swap);
                swap
            }
            _ => {
                let swap = b.right();
                b.set_right(parent_off);
                parent.set_left(swap);
                swap
            }
        };

        if swap != -1 {
            let mut sc = self.block(swap)?;
            sc.set_parent(parent_off);
            sc.set_child_type(match ct {
                ChildType::Right => ChildType::Right,
                _ => ChildType::Left,
            });
            self.write_block(&sc)?;
        }

        let parent_ct = parent.child_type()?;
        match parent_ct {
            ChildType::Root => {}
            ChildType::Left => {
                let mut gp = self.block(grandparent_off)?;
                gp.set_left(offset);
                self.write_block(&gp)?;
            }
            ChildType::Right => {
                let mut gp = self.block(grandparent_off)?;
                gp.set_right(offset);
                self.write_block(&gp)?;
            }
        }

        b.set_parent(grandparent_off);
        b.set_child_type(parent_ct);
        parent.set_parent(offset);
        parent.set_child_type(match ct {
            ChildType::Right => ChildType::Left,
            _ => ChildType::Right,
        });

        self.write_block(&parent)?;
        self.write_block(&b)
    }

    // ---- insert / delete cores --------------------------------------------

    fn put_root(&mut self, root: i64, key: &[u8], value: &[u8]) -> Result<(i64, bool)> {
        let (offset, created) = if root == -1 {
            (self.new_block(key, -1, ChildType::Root)?, true)
        } else {
            self.seek_or_create(root, key)?
        };

        self.set_value(offset, key, value)?;
        self.balance(offset)?;

        Ok((self.derive_root(offset)?, created))
    }

    fn delete_root(&mut self, root: i64, key: &[u8]) -> Result<(i64, bool)> {
        let target = self.find_from(root, key)?;
        if target == -1 {
            return Ok((root, false));
        }

        let v = self.block(target)?;
        let mut local_root = root;

        let (removed_color, x_off, x_parent, x_ct) = match (v.left() != -1, v.right() != -1) {
            (true, true) => self.splice_successor(&v, &mut local_root)?,
            (false, false) => {
                self.unlink(&v, -1, &mut local_root)?;
                (v.color()?, -1, v.parent(), v.child_type()?)
            }
            (has_left, _) => {
                let child_off = if has_left { v.left() } else { v.right() };
                let mut child = self.block(child_off)?;
                child.set_parent(v.parent());
                child.set_child_type(v.child_type()?);
                self.write_block(&child)?;
                self.unlink(&v, child_off, &mut local_root)?;
                (v.color()?, child_off, v.parent(), v.child_type()?)
            }
        };

        if removed_color == Color::Red || self.is_red(x_off)? {
            if x_off != -1 {
                self.set_color_at(x_off, Color::Black)?;
            }
        } else {
            if x_off != -1 {
                self.set_color_at(x_off, Color::DoubleBlack)?;
            }
            self.fix_double_black(x_off, x_parent, x_ct)?;
        }

        let new_root = if local_root == -1 {
            -1
        } else {
            self.derive_root(local_root)?
        };

        self.release_blob(&v)?;
        self.arena.release(Section::new(target, BLOCK_SIZE))?;

        Ok((new_root, true))
    }

    /// Points whatever held `v` — its parent's child slot or the local root —
    /// at `replacement` instead.
    fn unlink(&mut self, v: &Block, replacement: i64, local_root: &mut i64) -> Result<()> {
        match v.child_type()? {
            ChildType::Root => *local_root = replacement,
            ChildType::Left => {
                let mut p = self.block(v.parent())?;
                p.set_left(replacement);
                self.write_block(&p)?;
            }
            ChildType::Right => {
                let mut p = self.block(v.parent())?;
                p.set_right(replacement);
                self.write_block(&p)?;
            }
        }
        Ok(())
    }

    /// Two-children deletion: splices the in-order successor out of its slot
    /// and moves it into `v`'s position with `v`'s color. Returns the color
    /// physically removed from the tree plus the position — occupant,
    /// parent, slot — where the black-height deficit (if any) now sits.
    fn splice_successor(
        &mut self,
        v: &Block,
        local_root: &mut i64,
    ) -> Result<(Color, i64, i64, ChildType)> {
        let successor_off = self.head_of(v.right())?;
        let mut s = self.block(successor_off)?;
        let removed_color = s.color()?;
        let orphan = s.right();

        let (x_parent, x_ct);
        if successor_off == v.right() {
            // Successor is v's direct right child; its own right child stays
            // put and the deficit sits directly under the successor.
            x_parent = successor_off;
            x_ct = ChildType::Right;
        } else {
            // Splice the successor out of its left slot, handing its right
            // child to its old parent, then adopt v's right subtree.
            let old_parent_off = s.parent();
            let mut old_parent = self.block(old_parent_off)?;
            old_parent.set_left(orphan);
            self.write_block(&old_parent)?;

            if orphan != -1 {
                let mut o = self.block(orphan)?;
                o.set_parent(old_parent_off);
                o.set_child_type(ChildType::Left);
                self.write_block(&o)?;
            }

            s.set_right(v.right());
            let mut right = self.block(v.right())?;
            right.set_parent(successor_off);
            self.write_block(&right)?;

            x_parent = old_parent_off;
            x_ct = ChildType::Left;
        }

        s.set_left(v.left());
        if v.left() != -1 {
            let mut left = self.block(v.left())?;
            left.set_parent(successor_off);
            self.write_block(&left)?;
        }

        s.set_parent(v.parent());
        s.set_child_type(v.child_type()?);
        s.set_color(v.color()?);
        self.write_block(&s)?;
        self.unlink(v, successor_off, local_root)?;

        Ok((removed_color, orphan, x_parent, x_ct))
    }

    /// Absorbs a black-height deficit at the (possibly empty) position
    /// described by `x_off`/`parent_off`/`x_ct`, following the canonical
    /// double-black cases on the sibling and the sibling's children.
    fn fix_double_black(&mut self, x_off: i64, parent_off: i64, x_ct: ChildType) -> Result<()> {
        if parent_off == -1 || x_ct == ChildType::Root {
            // The deficit reached the root, where it simply disappears.
            if x_off != -1 {
                self.set_color_at(x_off, Color::Black)?;
            }
            return Ok(());
        }

        let parent = self.block(parent_off)?;
        let sibling_off = match x_ct {
            ChildType::Left => parent.right(),
            _ => parent.left(),
        };

        if sibling_off == -1 {
            if x_off != -1 {
                self.set_color_at(x_off, Color::Black)?;
            }
            self.set_color_at(parent_off, Color::DoubleBlack)?;
            return self.fix_double_black(parent_off, parent.parent(), parent.child_type()?);
        }

        let sibling = self.block(sibling_off)?;

        if sibling.color()? == Color::Red {
            self.set_color_at(parent_off, Color::Red)?;
            self.set_color_at(sibling_off, Color::Black)?;
            self.rotate_up(sibling_off)?;
            // The new sibling is black; re-examine from the same position.
            return self.fix_double_black(x_off, parent_off, x_ct);
        }

        let left_nephew = sibling.left();
        let right_nephew = sibling.right();
        let left_red = self.is_red(left_nephew)?;
        let right_red = self.is_red(right_nephew)?;

        if !left_red && !right_red {
            self.set_color_at(sibling_off, Color::Red)?;
            if x_off != -1 {
                self.set_color_at(x_off, Color::Black)?;
            }

            if parent.color()? == Color::Red {
                return self.set_color_at(parent_off, Color::Black);
            }
            if parent.child_type()? == ChildType::Root {
                return Ok(());
            }

            self.set_color_at(parent_off, Color::DoubleBlack)?;
            return self.fix_double_black(parent_off, parent.parent(), parent.child_type()?);
        }

        let parent_color = if parent.color()? == Color::DoubleBlack {
            Color::Black
        } else {
            parent.color()?
        };

        match sibling.child_type()? {
            ChildType::Left if left_red => {
                self.rotate_up(sibling_off)?;
                self.set_color_at(left_nephew, Color::Black)?;
                self.set_color_at(sibling_off, parent_color)?;
                self.set_color_at(parent_off, Color::Black)?;
            }
            ChildType::Left => {
                self.rotate_up(right_nephew)?;
                self.rotate_up(right_nephew)?;
                self.set_color_at(right_nephew, parent_color)?;
                self.set_color_at(parent_off, Color::Black)?;
            }
            ChildType::Right if right_red => {
                self.rotate_up(sibling_off)?;
                self.set_color_at(right_nephew, Color::Black)?;
                self.set_color_at(sibling_off, parent_color)?;
                self.set_color_at(parent_off, Color::Black)?;
            }
            ChildType::Right => {
                self.rotate_up(left_nephew)?;
                self.rotate_up(left_nephew)?;
                self.set_color_at(left_nephew, parent_color)?;
                self.set_color_at(parent_off, Color::Black)?;
            }
            ChildType::Root => {
                return Err(StoreError::corruption(format!(
                    "sibling block at {sibling_off} claims to be root"
                ))
                .into())
            }
        }

        if x_off != -1 {
            self.set_color_at(x_off, Color::Black)?;
        }
        Ok(())
    }

    // ---- traversal / duplication ------------------------------------------

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

    fn copy_subtree(&mut self, src: i64, parent: i64, ct: ChildType) -> Result<i64> {
        if src == -1 {
            return Ok(-1);
        }

        let src_block = self.block(src)?;
        let (section, _) = self.arena.allocate(BLOCK_SIZE)?;
        let offset = section.offset;

        if src_block.blob_offset() >= 0 {
            self.acquire_blob(src_block.blob_offset())?;
        }

        let left = self.copy_subtree(src_block.left(), offset, ChildType::Left)?;
        let right = self.copy_subtree(src_block.right(), offset, ChildType::Right)?;

        let mut b = src_block;
        b.set_offset(offset);
        b.set_parent(parent);
        b.set_child_type(ct);
        b.set_left(left);
        b.set_right(right);
        self.write_block(&b)?;

        Ok(offset)
    }

    fn release_subtree(&mut self, offset: i64) -> Result<()> {
        if offset == -1 {
            return Ok(());
        }

        let b = self.block(offset)?;
        self.release_subtree(b.left())?;
        self.release_subtree(b.right())?;
        self.release_blob(&b)?;
        self.arena.release(Section::new(offset, BLOCK_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Tree<HeapBackend> {
        Tree::heap(64).unwrap()
    }

    fn filled(n: usize) -> Tree<HeapBackend> {
        let mut t = tree();
        for i in 0..n {
            let key = format!("{i:04}");
            t.put(key.as_bytes(), key.as_bytes()).unwrap();
        }
        t
    }

    #[test]
    fn get_on_empty_tree_is_absent() {
        assert_eq!(tree().get(b"missing").unwrap(), None);
    }

    #[test]
    fn put_then_get_round_trips() {
        let mut t = tree();

        t.put(b"greeting", b"hello").unwrap();

        assert_eq!(t.get(b"greeting").unwrap(), Some(&b"hello"[..]));
        assert_eq!(t.len().unwrap(), 1);
    }

    #[test]
    fn overwrite_keeps_count_stable() {
        let mut t = tree();

        t.put(b"k", b"first").unwrap();
        t.put(b"k", b"second").unwrap();
        t.put(b"k", b"x").unwrap();

        assert_eq!(t.get(b"k").unwrap(), Some(&b"x"[..]));
        assert_eq!(t.len().unwrap(), 1);
        t.validate().unwrap();
    }

    #[test]
    fn ascending_inserts_stay_balanced() {
        let t = filled(128);

        t.validate().unwrap();
        assert_eq!(t.len().unwrap(), 128);
    }

    #[test]
    fn descending_inserts_stay_balanced() {
        let mut t = tree();
        for i in (0..128).rev() {
            let key = format!("{i:04}");
            t.put(key.as_bytes(), key.as_bytes()).unwrap();
        }

        t.validate().unwrap();
        assert_eq!(t.get(b"0000").unwrap(), Some(&b"0000"[..]));
    }

    #[test]
    fn values_survive_arena_growth() {
        let mut t = tree();
        let big = vec![0xAB; 512];

        for i in 0..64 {
            let key = format!("{i:04}");
            t.put(key.as_bytes(), &big).unwrap();
        }

        for i in 0..64 {
            let key = format!("{i:04}");
            assert_eq!(t.get(key.as_bytes()).unwrap(), Some(&big[..]));
        }
    }

    #[test]
    fn for_each_visits_in_key_order() {
        let t = filled(32);
        let mut seen = Vec::new();

        let ended = t
            .for_each(|k, _| {
                seen.push(k.to_vec());
                false
            })
            .unwrap();

        assert!(!ended);
        assert_eq!(seen.len(), 32);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn first_and_last_track_key_order() {
        let t = filled(16);

        let (first_key, _) = t.first().unwrap().unwrap();
        assert_eq!(first_key, b"0000");

        let (last_key, last_value) = t.last().unwrap().unwrap();
        assert_eq!(last_key, b"0015");
        assert_eq!(last_value, b"0015");

        assert_eq!(tree().first().unwrap(), None);
        assert_eq!(tree().last().unwrap(), None);
    }

    #[test]
    fn for_each_stops_early() {
        let t = filled(32);
        let mut visits = 0;

        let ended = t
            .for_each(|_, _| {
                visits += 1;
                visits == 5
            })
            .unwrap();

        assert!(ended);
        assert_eq!(visits, 5);
    }

    #[test]
    fn delete_leaf_then_get_is_absent() {
        let mut t = filled(8);

        t.delete(b"0007").unwrap();

        assert_eq!(t.get(b"0007").unwrap(), None);
        assert_eq!(t.len().unwrap(), 7);
        t.validate().unwrap();
    }

    #[test]
    fn delete_absent_key_is_a_noop() {
        let mut t = filled(8);

        t.delete(b"zzzz").unwrap();

        assert_eq!(t.len().unwrap(), 8);
        t.validate().unwrap();
    }

    #[test]
    fn delete_interior_keeps_remaining_keys() {
        let mut t = filled(64);

        for key in [b"0031", b"0000", b"0063", b"0017"] {
            t.delete(&key[..]).unwrap();
            t.validate().unwrap();
        }

        assert_eq!(t.len().unwrap(), 60);
        for i in 0..64 {
            let key = format!("{i:04}");
            let expect_absent = matches!(i, 31 | 0 | 63 | 17);
            assert_eq!(t.get(key.as_bytes()).unwrap().is_none(), expect_absent);
        }
    }

    #[test]
    fn delete_everything_in_insertion_order() {
        let mut t = filled(64);

        for i in 0..64 {
            let key = format!("{i:04}");
            t.delete(key.as_bytes()).unwrap();
            t.validate().unwrap();
        }

        assert_eq!(t.len().unwrap(), 0);
        assert_eq!(t.get(b"0000").unwrap(), None);
    }

    #[test]
    fn deleted_space_is_reused() {
        let mut t = filled(32);
        for i in 0..32 {
            let key = format!("{i:04}");
            t.delete(key.as_bytes()).unwrap();
        }
        let cap = t.arena.capacity();

        for i in 0..32 {
            let key = format!("{i:04}");
            t.put(key.as_bytes(), key.as_bytes()).unwrap();
        }

        assert_eq!(t.arena.capacity(), cap);
        t.validate().unwrap();
    }

    #[test]
    fn grow_value_zero_pads_and_doubles() {
        let mut t = tree();
        t.put(b"k", b"abc").unwrap();

        let view = t.grow_value(b"k", 5).unwrap();

        assert_eq!(view.len(), 6);
        assert_eq!(&view[..3], b"abc");
        assert_eq!(&view[3..], &[0, 0, 0]);
        t.validate().unwrap();
    }

    #[test]
    fn grow_value_creates_missing_keys() {
        let mut t = tree();

        let view = t.grow_value(b"fresh", 16).unwrap();
        view[0] = 7;

        assert_eq!(t.len().unwrap(), 1);
        assert_eq!(t.get(b"fresh").unwrap().unwrap()[0], 7);
        t.validate().unwrap();
    }

    #[test]
    fn grow_value_is_stable_when_large_enough() {
        let mut t = tree();
        t.grow_value(b"k", 8).unwrap()[..3].copy_from_slice(b"xyz");

        let view = t.grow_value(b"k", 4).unwrap();

        assert_eq!(view.len(), 8);
        assert_eq!(&view[..3], b"xyz");
    }

    #[test]
    fn reset_empties_the_tree_and_keeps_the_backend() {
        let mut t = filled(16);

        t.reset().unwrap();

        assert_eq!(t.len().unwrap(), 0);
        assert_eq!(t.get(b"0001").unwrap(), None);
        t.put(b"again", b"yes").unwrap();
        assert_eq!(t.get(b"again").unwrap(), Some(&b"yes"[..]));
    }

    #[test]
    fn image_round_trips_through_from_image() {
        let t = filled(16);

        let copy = Tree::from_image(t.image().unwrap()).unwrap();

        assert_eq!(copy.len().unwrap(), 16);
        assert_eq!(copy.get(b"0009").unwrap(), Some(&b"0009"[..]));
        copy.validate().unwrap();
    }

    #[test]
    fn checkout_shares_blobs_until_divergence() {
        let mut t = filled(4);

        let mut co = t.checkout().unwrap();

        assert_eq!(t.value_refs(b"0001").unwrap(), Some(2));
        assert_eq!(t.checkout_get(&co, b"0001").unwrap(), Some(&b"0001"[..]));

        t.checkout_put(&mut co, b"0001", b"changed").unwrap();

        assert_eq!(t.value_refs(b"0001").unwrap(), Some(1));
        assert_eq!(t.get(b"0001").unwrap(), Some(&b"0001"[..]));
        assert_eq!(t.checkout_get(&co, b"0001").unwrap(), Some(&b"changed"[..]));
    }

    #[test]
    fn checkout_same_size_overwrite_copies_the_blob() {
        let mut t = tree();
        t.put(b"k", b"aaaa").unwrap();
        let mut co = t.checkout().unwrap();

        t.checkout_put(&mut co, b"k", b"bbbb").unwrap();

        assert_eq!(t.get(b"k").unwrap(), Some(&b"aaaa"[..]));
        assert_eq!(t.checkout_get(&co, b"k").unwrap(), Some(&b"bbbb"[..]));
    }

    #[test]
    fn checkout_delete_leaves_source_intact() {
        let mut t = filled(8);
        let mut co = t.checkout().unwrap();

        t.checkout_delete(&mut co, b"0003").unwrap();

        assert_eq!(t.checkout_get(&co, b"0003").unwrap(), None);
        assert_eq!(co.len(), 7);
        assert_eq!(t.get(b"0003").unwrap(), Some(&b"0003"[..]));
        t.validate().unwrap();
    }

    #[test]
    fn discarding_a_checkout_restores_refcounts() {
        let mut t = filled(4);
        let co = t.checkout().unwrap();
        assert_eq!(t.value_refs(b"0002").unwrap(), Some(2));

        t.discard_checkout(co).unwrap();

        assert_eq!(t.value_refs(b"0002").unwrap(), Some(1));
        for i in 0..4 {
            let key = format!("{i:04}");
            assert_eq!(t.get(key.as_bytes()).unwrap(), Some(key.as_bytes()));
        }
    }

    #[test]
    fn close_then_use_reports_already_closed() {
        let mut t = filled(2);
        t.close().unwrap();

        let err = t.get(b"0000").unwrap_err();

        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::AlreadyClosed)
        ));
    }
}
