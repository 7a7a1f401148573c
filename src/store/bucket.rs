//! # Buckets
//!
//! A bucket is a nested key-value namespace whose backing bytes are a value
//! blob inside the owning tree, stored under a marker-prefixed key. The blob
//! holds a complete serialized arena (a tree image), so buckets nest
//! recursively: a sub-bucket is a marker-prefixed key inside its parent's
//! image.
//!
//! ## Read And Write Paths
//!
//! Reads consult the transaction's staged side first and fall back to the
//! committed root side, both as in-place image walks. Writes go to an owned
//! staged tree seeded from the scratch-side image; every write flushes the
//! staged tree's bytes back up through the [`ImageSink`] chain, landing in
//! the transaction's scratch tree. Nothing a bucket does touches the root
//! tree before commit.

use eyre::Result;

use crate::error::StoreError;
use crate::storage::HeapBackend;
use crate::tree::{Tree, TreeImage};

use super::txn::{bucket_key, validate_key, ImageSink, KeyBuf};
use super::BUCKET_INIT_SIZE;

/// A transient view of one nested namespace, bound to its transaction.
pub struct Bucket<'a> {
    key: KeyBuf,
    staged: Option<Tree<HeapBackend>>,
    staged_image: Option<Vec<u8>>,
    root_image: Option<Vec<u8>>,
    sink: Option<&'a mut dyn ImageSink>,
}

impl std::fmt::Debug for Bucket<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("key", &self.key)
            .field("staged", &self.staged)
            .field("staged_image", &self.staged_image)
            .field("root_image", &self.root_image)
            .field("sink", &self.sink.as_ref().map(|_| "<sink>"))
            .finish()
    }
}

impl<'a> Bucket<'a> {
    pub(crate) fn read_view(
        key: KeyBuf,
        staged_image: Option<Vec<u8>>,
        root_image: Option<Vec<u8>>,
    ) -> Self {
        Self {
            key,
            staged: None,
            staged_image,
            root_image,
            sink: None,
        }
    }

    pub(crate) fn writable(
        key: KeyBuf,
        root_image: Option<Vec<u8>>,
        staged: Tree<HeapBackend>,
        sink: &'a mut dyn ImageSink,
    ) -> Self {
        Self {
            key,
            staged: Some(staged),
            staged_image: None,
            root_image,
            sink: Some(sink),
        }
    }

    /// Retrieves a value: staged writes first, committed state second.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        validate_key(key)?;

        if let Some(staged) = self.staged.as_ref() {
            if let Some(value) = staged.get(key)? {
                return Ok(Some(value));
            }
        } else if let Some(image) = self.staged_image.as_deref() {
            if let Some(value) = TreeImage::new(image).get(key)? {
                return Ok(Some(value));
            }
        }

        match self.root_image.as_deref() {
            Some(image) => TreeImage::new(image).get(key),
            None => Ok(None),
        }
    }

    /// Stages a write into this bucket. Fails with `CannotWrite` on a
    /// read-only view.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        validate_key(key)?;

        match self.staged.as_mut() {
            Some(staged) => staged.put(key, value)?,
            None => return Err(StoreError::CannotWrite.into()),
        }

        self.flush_up()
    }

    /// Opens a read view of the nested bucket `name`, or `None` when it is
    /// not visible here.
    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'_>>> {
        let key = bucket_key(name);

        let staged_image = if let Some(staged) = self.staged.as_ref() {
            staged.get(&key)?.map(<[u8]>::to_vec)
        } else if let Some(image) = self.staged_image.as_deref() {
            TreeImage::new(image).get(&key)?.map(<[u8]>::to_vec)
        } else {
            None
        };

        let root_image = match self.root_image.as_deref() {
            Some(image) => TreeImage::new(image).get(&key)?.map(<[u8]>::to_vec),
            None => None,
        };

        if staged_image.is_none() && root_image.is_none() {
            return Ok(None);
        }

        Ok(Some(Bucket::read_view(key, staged_image, root_image)))
    }

    /// Opens the nested bucket `name` for writing, creating it when absent.
    pub fn create_bucket(&mut self, name: &[u8]) -> Result<Bucket<'_>> {
        if self.staged.is_none() || self.sink.is_none() {
            return Err(StoreError::CannotWrite.into());
        }

        let key = bucket_key(name);

        let root_image = match self.root_image.as_deref() {
            Some(image) => TreeImage::new(image).get(&key)?.map(<[u8]>::to_vec),
            None => None,
        };
        let staged_image = match self.staged.as_ref() {
            Some(staged) => staged.get(&key)?.map(<[u8]>::to_vec),
            None => None,
        };

        let sub = match staged_image {
            Some(image) => Tree::from_image(&image)?,
            None => Tree::heap(BUCKET_INIT_SIZE)?,
        };

        let image = sub.image()?.to_vec();
        self.store_image(&key, &image)?;

        Ok(Bucket::writable(key, root_image, sub, self))
    }

    /// Number of keys visible in the staged side of this bucket.
    pub fn staged_len(&self) -> Result<i64> {
        match (self.staged.as_ref(), self.staged_image.as_deref()) {
            (Some(staged), _) => staged.len(),
            (None, Some(image)) => TreeImage::new(image).len(),
            (None, None) => Ok(0),
        }
    }

    fn flush_up(&mut self) -> Result<()> {
        let staged = match self.staged.as_ref() {
            Some(staged) => staged,
            None => return Err(StoreError::CannotWrite.into()),
        };
        let sink = match self.sink.as_deref_mut() {
            Some(sink) => sink,
            None => return Err(StoreError::CannotWrite.into()),
        };

        sink.store_image(&self.key, staged.image()?)
    }
}

impl ImageSink for Bucket<'_> {
    fn store_image(&mut self, key: &[u8], image: &[u8]) -> Result<()> {
        let staged = match self.staged.as_mut() {
            Some(staged) => staged,
            None => return Err(StoreError::CannotWrite.into()),
        };

        let view = staged.grow_value(key, image.len() as i64)?;
        view[..image.len()].copy_from_slice(image);

        self.flush_up()
    }
}
