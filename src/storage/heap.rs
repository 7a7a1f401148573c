//! Heap-buffer backend: a plain growable, zero-filled byte vector. Used for
//! pure in-memory stores and for every scratch tree.

use eyre::{ensure, Result};

use crate::error::StoreError;

use super::{Backend, MIN_CAPACITY};

/// A growable in-memory byte region.
#[derive(Debug)]
pub struct HeapBackend {
    buf: Vec<u8>,
    cap: i64,
    closed: bool,
}

impl HeapBackend {
    /// Returns a zero-filled backend of at least `capacity_hint` bytes.
    pub fn with_capacity(capacity_hint: i64) -> Self {
        let cap = capacity_hint.max(MIN_CAPACITY);

        Self {
            buf: vec![0u8; cap as usize],
            cap,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        ensure!(!self.closed, StoreError::AlreadyClosed);
        Ok(())
    }
}

impl Backend for HeapBackend {
    fn grow(&mut self, min: i64) -> Result<bool> {
        self.ensure_open()?;

        if self.cap > min {
            return Ok(false);
        }

        while self.cap <= min {
            self.cap *= 2;
        }

        tracing::trace!(cap = self.cap, min, "heap backend grew");
        self.buf.resize(self.cap as usize, 0);
        Ok(true)
    }

    fn capacity(&self) -> i64 {
        self.cap
    }

    fn view(&self) -> Result<&[u8]> {
        self.ensure_open()?;
        Ok(&self.buf)
    }

    fn view_mut(&mut self) -> Result<&mut [u8]> {
        self.ensure_open()?;
        Ok(&mut self.buf)
    }

    fn sync(&mut self) -> Result<()> {
        self.ensure_open()
    }

    fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed = true;
        self.buf = Vec::new();
        Ok(())
    }
}
