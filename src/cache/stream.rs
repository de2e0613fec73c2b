/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! A positioned view over a [`Cache`].
//!
//! Grounded on `original_source` `neeraj/trunk/.../include/cache.h`'s
//! `Stream`/`InputStream`/`OutputStream`: the at-position `read`/`write`
//! variants serialize the position update under a monitor; the
//! offset-taking variants bypass it. `InputStream` rejects writes,
//! `OutputStream` rejects reads, both with `AccessDenied`.

use std::sync::Arc;

use crate::cache::cache::Cache;
use crate::errors::{ErrNO, KResult};
use crate::sched::Monitor;

pub struct Stream {
    cache: Arc<Cache>,
    position: std::sync::Mutex<i64>,
    monitor: Monitor,
}

impl Stream {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache, position: std::sync::Mutex::new(0), monitor: Monitor::new() }
    }

    pub fn size(&self) -> i64 {
        self.cache.size()
    }

    pub fn set_size(&self, size: i64) -> KResult<()> {
        self.cache.set_size(size)
    }

    pub fn position(&self) -> i64 {
        *self.position.lock().unwrap()
    }

    pub fn set_position(&self, pos: i64) {
        *self.position.lock().unwrap() = pos;
    }

    /// Reads `dst.len()` bytes at the current position, advancing it.
    pub fn read(&self, dst: &mut [u8]) -> KResult<usize> {
        self.monitor.lock()?;
        let pos = *self.position.lock().unwrap();
        let n = self.cache.read(dst, pos);
        if let Ok(n) = n {
            *self.position.lock().unwrap() = pos + n as i64;
        }
        self.monitor.unlock();
        n
    }

    /// Reads at an explicit offset, bypassing the position monitor.
    pub fn read_at(&self, dst: &mut [u8], offset: i64) -> KResult<usize> {
        self.cache.read(dst, offset)
    }

    pub fn write(&self, src: &[u8]) -> KResult<usize> {
        self.monitor.lock()?;
        let pos = *self.position.lock().unwrap();
        let n = self.cache.write(src, pos);
        if let Ok(n) = n {
            *self.position.lock().unwrap() = pos + n as i64;
        }
        self.monitor.unlock();
        n
    }

    pub fn write_at(&self, src: &[u8], offset: i64) -> KResult<usize> {
        self.cache.write(src, offset)
    }

    pub fn flush(&self) -> KResult<()> {
        self.cache.flush()
    }
}

pub struct InputStream(Stream);

impl InputStream {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self(Stream::new(cache))
    }

    pub fn read(&self, dst: &mut [u8]) -> KResult<usize> {
        self.0.read(dst)
    }

    pub fn write(&self, _src: &[u8]) -> KResult<usize> {
        Err(ErrNO::AccessDenied)
    }

    pub fn position(&self) -> i64 {
        self.0.position()
    }

    pub fn set_position(&self, pos: i64) {
        self.0.set_position(pos)
    }
}

pub struct OutputStream(Stream);

impl OutputStream {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self(Stream::new(cache))
    }

    pub fn write(&self, src: &[u8]) -> KResult<usize> {
        self.0.write(src)
    }

    pub fn read(&self, _dst: &mut [u8]) -> KResult<usize> {
        Err(ErrNO::AccessDenied)
    }

    pub fn flush(&self) -> KResult<()> {
        self.0.flush()
    }
}
