/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! A single physical-frame descriptor.
//!
//! Grounded on `original_source`
//! `neeraj/trunk/.../port/page.cpp` and `.../include/cache.h`: reference
//! count, owning `(cache, offset)`, `Changed`/`Free` flags, a per-sector
//! dirty bitmap, and the `fill`/`sync` protocol that moves bytes between
//! the frame and a backing store. Identity is the frame's index into
//! [`crate::page::page_table::PageTable`]'s descriptor array rather than a
//! pointer, per the arena-plus-index pattern.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::cache::backing_store::BackingStore;
use crate::config::PAGE_SIZE;
use crate::errors::{ErrNO, KResult};
use crate::sched::Monitor;

pub const FLAG_CHANGED: u32 = 1 << 0;
pub const FLAG_FREE: u32 = 1 << 1;

/// Fixed epoch every `Page` measures `last_updated_millis` against.
/// `Instant::now().elapsed()` on its own is always ~0 since the `Instant`
/// is constructed and consumed on the same line; staleness needs the same
/// kind of shared monotonic base `sched::alarm` uses for deadlines.
fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

struct Binding {
    cache: Option<u64>,
    offset: i64,
    page_set: Option<usize>,
}

pub struct Page {
    pub index: usize,
    refcount: AtomicU32,
    binding: Mutex<Binding>,
    flags: AtomicU32,
    filled: AtomicBool,
    dirty_bits: Mutex<u64>,
    last_updated_millis: AtomicU64,
    data: Mutex<Vec<u8>>,
    /// Serializes `fill`/`sync` against concurrent readers/writers of this
    /// page's frame.
    pub monitor: Monitor,
}

impl Page {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            refcount: AtomicU32::new(0),
            binding: Mutex::new(Binding { cache: None, offset: 0, page_set: None }),
            flags: AtomicU32::new(FLAG_FREE),
            filled: AtomicBool::new(false),
            dirty_bits: Mutex::new(0),
            last_updated_millis: AtomicU64::new(0),
            data: Mutex::new(vec![0u8; PAGE_SIZE]),
            monitor: Monitor::new(),
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Increments the reference count and returns the new value.
    pub fn add_ref(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the reference count and returns the new value.
    pub fn release(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn cache_id(&self) -> Option<u64> {
        self.binding.lock().unwrap().cache
    }

    pub fn offset(&self) -> i64 {
        self.binding.lock().unwrap().offset
    }

    pub fn page_set(&self) -> Option<usize> {
        self.binding.lock().unwrap().page_set
    }

    pub fn set_page_set(&self, id: Option<usize>) {
        self.binding.lock().unwrap().page_set = id;
    }

    /// Binds this (previously free) page to `(cache, offset)`, matching
    /// `Page::set`.
    pub fn bind(&self, cache: u64, offset: i64) {
        let mut b = self.binding.lock().unwrap();
        b.cache = Some(cache);
        b.offset = offset;
        self.filled.store(false, Ordering::Release);
        self.flags.store(0, Ordering::Release);
        *self.dirty_bits.lock().unwrap() = 0;
    }

    /// Unbinds the page (it is returning to a free or standby list).
    pub fn unbind(&self) -> Option<u64> {
        let mut b = self.binding.lock().unwrap();
        let prior = b.cache.take();
        b.offset = 0;
        self.flags.store(0, Ordering::Release);
        *self.dirty_bits.lock().unwrap() = 0;
        self.filled.store(false, Ordering::Release);
        prior
    }

    pub fn is_changed(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_CHANGED != 0
    }

    pub fn set_changed(&self, v: bool) {
        if v {
            self.flags.fetch_or(FLAG_CHANGED, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!FLAG_CHANGED, Ordering::AcqRel);
        }
    }

    pub fn is_free_flagged(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_FREE != 0
    }

    pub fn set_free_flag(&self, v: bool) {
        if v {
            self.flags.fetch_or(FLAG_FREE, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!FLAG_FREE, Ordering::AcqRel);
        }
    }

    pub fn is_filled(&self) -> bool {
        self.filled.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        let now = epoch().elapsed().as_millis() as u64;
        self.last_updated_millis.store(now, Ordering::Relaxed);
    }

    pub fn is_stale(&self, threshold_millis: u64) -> bool {
        let now = epoch().elapsed().as_millis() as u64;
        now.saturating_sub(self.last_updated_millis.load(Ordering::Relaxed)) >= threshold_millis
    }

    /// Marks `[offset, offset+len)` within the page (relative) dirty, one
    /// bit per `sector_size` chunk.
    pub fn mark_dirty(&self, rel_offset: usize, len: usize, sector_size: usize) {
        let mut bits = self.dirty_bits.lock().unwrap();
        let start_sector = rel_offset / sector_size;
        let end_sector = (rel_offset + len + sector_size - 1) / sector_size;
        for s in start_sector..end_sector.min(64) {
            *bits |= 1 << s;
        }
    }

    /// Copies `src` into the frame at relative offset `rel_offset`.
    pub fn write_local(&self, rel_offset: usize, src: &[u8]) {
        let mut data = self.data.lock().unwrap();
        data[rel_offset..rel_offset + src.len()].copy_from_slice(src);
    }

    /// Copies out of the frame at relative offset `rel_offset`.
    pub fn read_local(&self, rel_offset: usize, dst: &mut [u8]) {
        let data = self.data.lock().unwrap();
        dst.copy_from_slice(&data[rel_offset..rel_offset + dst.len()]);
    }

    /// Fills the frame from the backing store if not already filled.
    /// Idempotent; serialized by `self.monitor`. Mirrors `Page::fill`.
    pub fn fill(&self, store: &dyn BackingStore) -> KResult<()> {
        self.monitor.lock()?;
        let result = (|| {
            if self.filled.load(Ordering::Acquire) {
                return Ok(());
            }
            let page_offset = self.offset();
            let mut data = self.data.lock().unwrap();
            let mut got = 0usize;
            while got < PAGE_SIZE {
                let n = store.read(&mut data[got..], page_offset + got as i64)?;
                if n == 0 {
                    for b in &mut data[got..] {
                        *b = 0;
                    }
                    break;
                }
                got += n;
            }
            self.filled.store(true, Ordering::Release);
            Ok(())
        })();
        self.monitor.unlock();
        result
    }

    /// Writes back every dirty sector as contiguous runs, clearing the
    /// bitmap, and returns total bytes written. Mirrors `Page::sync`.
    pub fn sync(&self, store: &dyn BackingStore, sector_size: usize) -> KResult<usize> {
        self.monitor.lock()?;
        let result = (|| {
            let bits = {
                let mut b = self.dirty_bits.lock().unwrap();
                std::mem::replace(&mut *b, 0)
            };
            if bits == 0 {
                return Ok(0);
            }
            let page_offset = self.offset();
            let data = self.data.lock().unwrap();
            let num_sectors = (PAGE_SIZE / sector_size).min(64);
            let mut written = 0usize;
            let mut s = 0usize;
            while s < num_sectors {
                if bits & (1 << s) == 0 {
                    s += 1;
                    continue;
                }
                let run_start = s;
                while s < num_sectors && bits & (1 << s) != 0 {
                    s += 1;
                }
                let run_len_sectors = s - run_start;
                let byte_off = run_start * sector_size;
                let byte_len = run_len_sectors * sector_size;
                let n = store.write(&data[byte_off..byte_off + byte_len], page_offset + byte_off as i64)?;
                written += n;
            }
            Ok(written)
        })();
        self.monitor.unlock();
        result.map(|n| {
            self.touch();
            n
        })
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0)
    }
}

pub fn align_down(offset: i64, size: usize) -> i64 {
    let size = size as i64;
    offset & !(size - 1)
}

pub const fn check_page_size() -> KResult<()> {
    if PAGE_SIZE == 0 || PAGE_SIZE & (PAGE_SIZE - 1) != 0 {
        Err(ErrNO::BadAlign)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn freshly_touched_page_is_not_stale() {
        let page = Page::new(0);
        page.touch();
        assert!(!page.is_stale(50));
    }

    #[test]
    fn page_becomes_stale_after_threshold_elapses() {
        let page = Page::new(0);
        page.touch();
        sleep(Duration::from_millis(30));
        assert!(page.is_stale(10));
    }
}
