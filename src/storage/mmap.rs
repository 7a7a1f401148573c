//! # Memory-Mapped File Backend
//!
//! `MmapBackend` maps the arena file directly into the process address space
//! so that block and blob reads are plain slice accesses with no intermediate
//! copy. The file *is* the arena: byte 0 of the mapping is the trunk record,
//! and everything after it is block/blob storage.
//!
//! ## Growth
//!
//! Growing a mapping is a three-step dance, in this order:
//!
//! 1. flush and drop the current mapping,
//! 2. truncate the file to the new capacity,
//! 3. map the file again.
//!
//! The old mapping must be gone before the truncate — extending the file
//! underneath a live mapping leaves the mapping at the stale length, and the
//! next access past it faults. Capacity follows the shared doubling strategy,
//! seeded from the on-disk file size when the file is non-empty (the reopen
//! path) and from the requested size when it is fresh.
//!
//! ## Durability
//!
//! `sync()` runs `msync` via [`memmap2::MmapMut::flush`]; `close()` flushes,
//! unmaps, and drops the file handle. There is no write-ahead log anywhere in
//! this design: a crash between two related writes can tear them, and reopen
//! makes no attempt to detect that.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use crate::error::StoreError;

use super::Backend;

/// A file-backed, memory-mapped byte region.
#[derive(Debug)]
pub struct MmapBackend {
    file: Option<File>,
    map: Option<MmapMut>,
    cap: i64,
    path: PathBuf,
}

impl MmapBackend {
    /// Opens (creating when absent) the file at `dir/name` and maps it when
    /// it already holds data. A fresh, empty file stays unmapped until the
    /// first [`Backend::grow`].
    pub fn open(dir: impl AsRef<Path>, name: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(name.as_ref());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("failed to open arena file '{}'", path.display()))?;

        let cap = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len() as i64;

        let map = if cap > 0 { Some(map_file(&file, &path)?) } else { None };

        Ok(Self {
            file: Some(file),
            map,
            cap,
            path,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> Result<&File> {
        match self.file.as_ref() {
            Some(f) => Ok(f),
            None => Err(StoreError::AlreadyClosed.into()),
        }
    }
}

fn map_file(file: &File, path: &Path) -> Result<MmapMut> {
    // SAFETY: MmapMut::map_mut is unsafe because externally modified or
    // truncated files invalidate the mapping. This is safe because:
    // 1. The arena file is owned exclusively by this backend for its lifetime
    //    and is not meant to be touched by other processes.
    // 2. Every truncation goes through grow(), which drops the old mapping
    //    first and remaps afterwards, so no mapping outlives its file length.
    // 3. All access goes through view()/view_mut(), bounded by the mapping.
    unsafe {
        MmapMut::map_mut(file).wrap_err_with(|| format!("failed to map '{}'", path.display()))
    }
}

impl Backend for MmapBackend {
    fn grow(&mut self, min: i64) -> Result<bool> {
        self.file()?;

        if self.cap > min {
            return Ok(false);
        }

        let mut cap = self.cap;
        if cap == 0 {
            cap = min.max(1);
        }

        while cap <= min {
            cap *= 2;
        }

        // Unmap before truncating so the mapping never covers a stale length.
        if let Some(map) = self.map.take() {
            map.flush()
                .wrap_err("failed to flush mapping before grow")?;
            drop(map);
        }

        let file = self.file()?;
        file.set_len(cap as u64)
            .wrap_err_with(|| format!("failed to extend '{}' to {} bytes", self.path.display(), cap))
            .wrap_err(StoreError::CannotAllocate)?;

        self.map = Some(map_file(file, &self.path)?);
        self.cap = cap;

        tracing::debug!(cap, min, path = %self.path.display(), "mapped backend grew");
        Ok(true)
    }

    fn capacity(&self) -> i64 {
        self.cap
    }

    fn view(&self) -> Result<&[u8]> {
        self.file()?;
        Ok(self.map.as_deref().unwrap_or(&[]))
    }

    fn view_mut(&mut self) -> Result<&mut [u8]> {
        self.file()?;
        Ok(self.map.as_deref_mut().unwrap_or(&mut []))
    }

    fn sync(&mut self) -> Result<()> {
        self.file()?;

        if let Some(map) = self.map.as_ref() {
            map.flush().wrap_err("failed to sync mapping")?;
        }

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        ensure!(self.file.is_some(), StoreError::AlreadyClosed);

        if let Some(map) = self.map.take() {
            map.flush().wrap_err("failed to flush mapping on close")?;
            drop(map);
        }

        self.file = None;
        Ok(())
    }
}
