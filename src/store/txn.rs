//! # Transactions
//!
//! A transaction pairs a read-only handle to the root tree with, for update
//! transactions, a writable handle to the volatile scratch tree. Reads check
//! the scratch tree first and fall back to the root; writes land only in
//! scratch. The store merges scratch into root after the transaction body
//! returns successfully — a body that returns an error commits nothing.
//!
//! ## Key Namespace
//!
//! Bucket metadata lives in the same tree as ordinary keys, under keys
//! prefixed with the reserved marker byte [`BUCKET_MARKER`](super::BUCKET_MARKER).
//! User keys may therefore not start with the marker, and empty keys are
//! rejected outright.

use eyre::Result;
use smallvec::SmallVec;

use crate::error::StoreError;
use crate::storage::{Backend, HeapBackend};
use crate::tree::Tree;

use super::bucket::Bucket;
use super::{BUCKET_INIT_SIZE, BUCKET_MARKER};

/// Receives a serialized bucket image for a prefixed key. Implemented by the
/// transaction (writing to the scratch tree) and by writable buckets
/// (writing to their staged tree and propagating upward).
pub(crate) trait ImageSink {
    fn store_image(&mut self, key: &[u8], image: &[u8]) -> Result<()>;
}

/// The key buffer used for marker-prefixed bucket keys.
pub(crate) type KeyBuf = SmallVec<[u8; 64]>;

pub(crate) fn bucket_key(name: &[u8]) -> KeyBuf {
    let mut key = KeyBuf::new();
    key.push(BUCKET_MARKER);
    key.extend_from_slice(name);
    key
}

/// Rejects keys the transaction surface cannot accept.
pub(crate) fn validate_key(key: &[u8]) -> Result<()> {
    match key.first() {
        None => Err(StoreError::InvalidKey {
            reason: "key is empty",
        }
        .into()),
        Some(&BUCKET_MARKER) => Err(StoreError::InvalidKey {
            reason: "key starts with the reserved bucket marker",
        }
        .into()),
        Some(_) => Ok(()),
    }
}

/// A read or update transaction over one store.
pub struct Txn<'t, B: Backend> {
    root: &'t Tree<B>,
    scratch: Option<&'t mut Tree<HeapBackend>>,
}

impl<'t, B: Backend> Txn<'t, B> {
    pub(crate) fn read_only(root: &'t Tree<B>) -> Self {
        Self {
            root,
            scratch: None,
        }
    }

    pub(crate) fn update(root: &'t Tree<B>, scratch: &'t mut Tree<HeapBackend>) -> Self {
        Self {
            root,
            scratch: Some(scratch),
        }
    }

    /// Retrieves a value: staged writes first, committed state second.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        validate_key(key)?;

        if let Some(scratch) = self.scratch.as_deref() {
            if let Some(value) = scratch.get(key)? {
                return Ok(Some(value));
            }
        }

        self.root.get(key)
    }

    /// Stages a write. Fails with `CannotWrite` in a read transaction.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        validate_key(key)?;

        match self.scratch.as_deref_mut() {
            Some(scratch) => scratch.put(key, value),
            None => Err(StoreError::CannotWrite.into()),
        }
    }

    /// Opens a read view of the bucket named `name`, or `None` when no such
    /// bucket is visible to this transaction.
    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'_>>> {
        let key = bucket_key(name);

        let staged_image = match self.scratch.as_deref() {
            Some(scratch) => scratch.get(&key)?.map(<[u8]>::to_vec),
            None => None,
        };
        let root_image = self.root.get(&key)?.map(<[u8]>::to_vec);

        if staged_image.is_none() && root_image.is_none() {
            return Ok(None);
        }

        Ok(Some(Bucket::read_view(key, staged_image, root_image)))
    }

    /// Opens the bucket named `name` for writing, creating it when absent.
    /// Fails with `CannotWrite` in a read transaction.
    pub fn create_bucket(&mut self, name: &[u8]) -> Result<Bucket<'_>> {
        if self.scratch.is_none() {
            return Err(StoreError::CannotWrite.into());
        }

        let key = bucket_key(name);
        let root_image = self.root.get(&key)?.map(<[u8]>::to_vec);
        let staged_image = match self.scratch.as_deref() {
            Some(scratch) => scratch.get(&key)?.map(<[u8]>::to_vec),
            None => None,
        };

        let staged = match staged_image {
            Some(image) => Tree::from_image(&image)?,
            None => Tree::heap(BUCKET_INIT_SIZE)?,
        };

        // Materialize the bucket key in scratch right away, so creating an
        // empty bucket is itself a staged write.
        self.store_image(&key, staged.image()?)?;

        Ok(Bucket::writable(key, root_image, staged, self))
    }
}

impl<B: Backend> ImageSink for Txn<'_, B> {
    fn store_image(&mut self, key: &[u8], image: &[u8]) -> Result<()> {
        let scratch = match self.scratch.as_deref_mut() {
            Some(scratch) => scratch,
            None => return Err(StoreError::CannotWrite.into()),
        };

        let view = scratch.grow_value(key, image.len() as i64)?;
        view[..image.len()].copy_from_slice(image);
        Ok(())
    }
}
