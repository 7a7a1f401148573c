//! # Store Module
//!
//! The public façade: a root tree behind a reader/writer lock, a volatile
//! scratch tree for staging, and the transaction surface on top.
//!
//! ## Concurrency Model
//!
//! Single writer, many readers. Update transactions hold the writer lock for
//! their whole body including the commit-time merge, so commit duration is
//! proportional to scratch size. Read transactions share the reader lock and
//! never block each other. Tree mutation itself is unsynchronized — the lock
//! is what grants it exclusive access.
//!
//! ## Commit
//!
//! `update` runs the body against a transaction whose writes land in the
//! scratch tree. When the body returns `Ok`, commit walks the scratch tree
//! in order: plain entries are put into the root tree, marker-prefixed
//! entries are merged recursively into the matching root-side bucket image.
//! A body error skips the merge entirely, and the scratch tree is reset
//! after every cycle either way. There is no write-ahead log: a crash in the
//! middle of a merge can leave the root partially updated.

mod bucket;
mod txn;

pub use bucket::Bucket;
pub use txn::Txn;

use eyre::Result;
use parking_lot::RwLock;

use crate::error::StoreError;
use crate::storage::{Backend, HeapBackend, MmapBackend};
use crate::tree::{Tree, TreeImage};

/// Reserved first byte of every bucket metadata key.
pub const BUCKET_MARKER: u8 = b'_';

/// Arena size a fresh bucket image starts from.
pub(crate) const BUCKET_INIT_SIZE: i64 = 256;

/// Store capacity used when the caller passes no hint.
pub(crate) const DEFAULT_CAPACITY: i64 = 1024;

struct Inner<B> {
    root: Option<Tree<B>>,
    scratch: Tree<HeapBackend>,
}

/// An embedded key-value store over one arena-backed tree.
pub struct Store<B: Backend> {
    inner: RwLock<Inner<B>>,
}

impl Store<HeapBackend> {
    /// Opens a pure in-memory store of at least `capacity_hint` bytes.
    pub fn open(capacity_hint: i64) -> Result<Self> {
        Self::with_tree(Tree::heap(effective(capacity_hint))?)
    }
}

impl Store<MmapBackend> {
    /// Opens a file-backed, memory-mapped store at `dir/name`, initializing
    /// the trunk when the file is fresh.
    pub fn open_mapped(
        dir: impl AsRef<std::path::Path>,
        name: impl AsRef<std::path::Path>,
        capacity_hint: i64,
    ) -> Result<Self> {
        Self::with_tree(Tree::mapped(dir, name, effective(capacity_hint))?)
    }
}

fn effective(capacity_hint: i64) -> i64 {
    if capacity_hint <= 0 {
        DEFAULT_CAPACITY
    } else {
        capacity_hint
    }
}

impl<B: Backend> Store<B> {
    fn with_tree(root: Tree<B>) -> Result<Self> {
        Ok(Self {
            inner: RwLock::new(Inner {
                root: Some(root),
                scratch: Tree::heap(DEFAULT_CAPACITY)?,
            }),
        })
    }

    /// Retrieves the value for `key` from committed state.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let guard = self.inner.read();
        let root = open_tree(&guard)?;
        Ok(root.get(key)?.map(<[u8]>::to_vec))
    }

    /// Writes `key` directly into the root tree, outside any transaction.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut guard = self.inner.write();
        open_tree_mut(&mut guard)?.put(key, value)
    }

    /// Removes `key` directly from the root tree. Absent keys are a no-op.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut guard = self.inner.write();
        open_tree_mut(&mut guard)?.delete(key)
    }

    /// In-order traversal of committed state with early termination.
    pub fn for_each<F>(&self, visit: F) -> Result<bool>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let guard = self.inner.read();
        open_tree(&guard)?.for_each(visit)
    }

    /// Number of committed keys.
    pub fn len(&self) -> Result<i64> {
        let guard = self.inner.read();
        open_tree(&guard)?.len()
    }

    /// Whether no keys are committed.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Ensures the stored value for `key` spans at least `min_size` bytes
    /// and returns a copy of the full value.
    pub fn grow_value(&self, key: &[u8], min_size: i64) -> Result<Vec<u8>> {
        let mut guard = self.inner.write();
        let view = open_tree_mut(&mut guard)?.grow_value(key, min_size)?;
        Ok(view.to_vec())
    }

    /// Flushes the backend.
    pub fn sync(&self) -> Result<()> {
        let mut guard = self.inner.write();
        open_tree_mut(&mut guard)?.sync()
    }

    /// Checks the tree invariants of committed state.
    pub fn validate(&self) -> Result<()> {
        let guard = self.inner.read();
        open_tree(&guard)?.validate()
    }

    /// Flushes and closes the store. Every later operation — including a
    /// second close — fails with `AlreadyClosed`.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.inner.write();
        match guard.root.take() {
            Some(mut root) => root.close(),
            None => Err(StoreError::AlreadyClosed.into()),
        }
    }

    /// Runs `body` as a read transaction under the shared reader lock.
    pub fn read<F>(&self, body: F) -> Result<()>
    where
        F: FnOnce(&Txn<'_, B>) -> Result<()>,
    {
        let guard = self.inner.read();
        let root = open_tree(&guard)?;
        let txn = Txn::read_only(root);
        body(&txn)
    }

    /// Runs `body` as an update transaction under the writer lock, merging
    /// its staged writes into the root tree when it returns `Ok`. A body
    /// error commits nothing. The scratch tree is reset afterwards either
    /// way.
    pub fn update<F>(&self, body: F) -> Result<()>
    where
        F: FnOnce(&mut Txn<'_, B>) -> Result<()>,
    {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let root = match inner.root.as_mut() {
            Some(root) => root,
            None => return Err(StoreError::AlreadyClosed.into()),
        };

        let outcome = {
            let mut txn = Txn::update(root, &mut inner.scratch);
            body(&mut txn)
        };

        let committed = match outcome {
            Ok(()) => commit(root, &inner.scratch),
            Err(err) => Err(err),
        };

        inner.scratch.reset()?;
        committed
    }
}

fn open_tree<'g, B: Backend>(guard: &'g Inner<B>) -> Result<&'g Tree<B>> {
    match guard.root.as_ref() {
        Some(root) => Ok(root),
        None => Err(StoreError::AlreadyClosed.into()),
    }
}

fn open_tree_mut<'g, B: Backend>(guard: &'g mut Inner<B>) -> Result<&'g mut Tree<B>> {
    match guard.root.as_mut() {
        Some(root) => Ok(root),
        None => Err(StoreError::AlreadyClosed.into()),
    }
}

/// Applies every scratch entry to the root tree, recursing into bucket
/// images.
fn commit<B: Backend>(root: &mut Tree<B>, scratch: &Tree<HeapBackend>) -> Result<()> {
    let staged = scratch.len()?;
    if staged == 0 {
        return Ok(());
    }

    let mut outcome = Ok(());
    scratch.for_each(|key, value| {
        let step = if key.first() == Some(&BUCKET_MARKER) {
            merge_bucket_image(root, key, value)
        } else {
            root.put(key, value)
        };

        match step {
            Ok(()) => false,
            Err(err) => {
                outcome = Err(err);
                true
            }
        }
    })?;

    tracing::debug!(staged, "committed update transaction");
    outcome
}

/// Merges a serialized bucket image into `dst` under `key`: plain entries
/// are written into the existing (or fresh) root-side image, nested bucket
/// entries recurse.
fn merge_bucket_image<B: Backend>(dst: &mut Tree<B>, key: &[u8], image: &[u8]) -> Result<()> {
    let mut merged = match dst.get(key)? {
        Some(existing) => Tree::from_image(existing)?,
        None => Tree::heap(BUCKET_INIT_SIZE)?,
    };

    let mut outcome = Ok(());
    TreeImage::new(image).for_each(|k, v| {
        let step = if k.first() == Some(&BUCKET_MARKER) {
            merge_bucket_image(&mut merged, k, v)
        } else {
            merged.put(k, v)
        };

        match step {
            Ok(()) => false,
            Err(err) => {
                outcome = Err(err);
                true
            }
        }
    })?;
    outcome?;

    let bytes = merged.image()?;
    let view = dst.grow_value(key, bytes.len() as i64)?;
    view[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}
