/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! The abstract byte channel a [`crate::cache::cache::Cache`] fills from
//! and flushes to.
//!
//! Device-backed implementations (disk partition, network block device)
//! are external collaborators out of scope for this crate; the one
//! concrete implementation here, [`MemoryBackingStore`], exists so the
//! cache and stream protocols are exercisable without a real device.

use std::sync::Mutex;

use crate::errors::{ErrNO, KResult};

pub trait BackingStore: Send + Sync {
    /// Reads into `buf` starting at `offset`, returning the number of
    /// bytes actually read (0 at end-of-store).
    fn read(&self, buf: &mut [u8], offset: i64) -> KResult<usize>;

    /// Writes `buf` at `offset`, returning the number of bytes written.
    fn write(&self, buf: &[u8], offset: i64) -> KResult<usize>;

    fn get_size(&self) -> KResult<i64>;

    fn set_size(&self, size: i64) -> KResult<()>;

    fn flush(&self) -> KResult<()> {
        Ok(())
    }
}

/// An in-memory backing store, growable on write past its current size.
pub struct MemoryBackingStore {
    data: Mutex<Vec<u8>>,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self { data: Mutex::new(Vec::new()) }
    }

    pub fn with_size(size: usize) -> Self {
        Self { data: Mutex::new(vec![0u8; size]) }
    }
}

impl Default for MemoryBackingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingStore for MemoryBackingStore {
    fn read(&self, buf: &mut [u8], offset: i64) -> KResult<usize> {
        if offset < 0 {
            return Err(ErrNO::InvalidArgs);
        }
        let data = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, buf: &[u8], offset: i64) -> KResult<usize> {
        if offset < 0 {
            return Err(ErrNO::InvalidArgs);
        }
        let mut data = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset + buf.len() > data.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn get_size(&self) -> KResult<i64> {
        Ok(self.data.lock().unwrap().len() as i64)
    }

    fn set_size(&self, size: i64) -> KResult<()> {
        if size < 0 {
            return Err(ErrNO::InvalidArgs);
        }
        self.data.lock().unwrap().resize(size as usize, 0);
        Ok(())
    }
}
