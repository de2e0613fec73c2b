/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! Maps a [`crate::cache::backing_store::BackingStore`] to resident pages.
//!
//! Grounded on `original_source` `kala/png/.../port/cache.cpp`:
//! `getPage`/`read`/`write`/`change`/`clean`/`setSize`/`flush`/`clean()`
//! (aging)/`invalidate`/`getSize`/`getSectorSize`. Reference counting via
//! COM-style `addRef`/`release` in the original becomes ordinary `Arc`
//! sharing here — every `Cache` is handed out wrapped in `Arc<Cache>`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::backing_store::BackingStore;
use crate::config::{DELAYED_WRITE_SECONDS, PAGE_SIZE};
use crate::errors::{ErrNO, KResult};
use crate::page::page::align_down;
use crate::page::page_table::{PageSetId, PageTable};
use crate::sched::Monitor;

fn next_cache_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// A page-table-entry-shaped handle to a resident page, as handed back by
/// [`Cache::get`]: the frame index shifted up past the low flag bits, with
/// `PTE_VALID` always set and `PTE_DIRTY` left for the caller (an mmu
/// emulation layer above this crate) to set before calling [`Cache::put`].
pub const PTE_VALID: u64 = 1 << 0;
pub const PTE_DIRTY: u64 = 1 << 1;
const PTE_SHIFT: u32 = 2;

fn encode_pte(idx: usize) -> u64 {
    ((idx as u64) << PTE_SHIFT) | PTE_VALID
}

fn decode_pte(pte: u64) -> Option<usize> {
    if pte & PTE_VALID == 0 {
        None
    } else {
        Some((pte >> PTE_SHIFT) as usize)
    }
}

pub struct Cache {
    pub id: u64,
    pub monitor: Monitor,
    store: Arc<dyn BackingStore>,
    page_table: Arc<PageTable>,
    page_set: PageSetId,
    size: AtomicI64,
    sector_size: usize,
    /// Pages currently marked `Changed`, i.e. this cache's changed list.
    changed: Mutex<Vec<usize>>,
}

impl Cache {
    pub fn new(store: Arc<dyn BackingStore>, page_table: Arc<PageTable>, page_set: PageSetId) -> KResult<Arc<Self>> {
        let size = store.get_size()?;
        Ok(Arc::new(Self {
            id: next_cache_id(),
            monitor: Monitor::new(),
            store,
            page_table,
            page_set,
            size: AtomicI64::new(size),
            sector_size: crate::config::DEFAULT_SECTOR_SIZE,
            changed: Mutex::new(Vec::new()),
        }))
    }

    pub fn size(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn page_count(&self) -> u32 {
        self.page_table.cache_page_count(self.id)
    }

    pub fn has_changed_pages(&self) -> bool {
        !self.changed.lock().unwrap().is_empty()
    }

    /// Finds or creates the resident page covering `offset`, retrying
    /// through a flush-and-wait cycle if the page pool has nothing to
    /// give. Mirrors `Cache::getPage`.
    pub fn get_page(&self, offset: i64) -> KResult<usize> {
        let offset = align_down(offset, PAGE_SIZE);
        loop {
            self.monitor.lock()?;
            if offset >= self.size.load(Ordering::Acquire) {
                self.monitor.unlock();
                return Err(ErrNO::OutOfRange);
            }
            if let Some(idx) = self.page_table.lookup(self.id, offset) {
                self.monitor.unlock();
                return Ok(idx);
            }
            if let Some(idx) = crate::page::page_set::alloc_for(&self.page_table, self.page_set, self.id, offset) {
                self.monitor.unlock();
                return Ok(idx);
            }
            if let Some(idx) = crate::page::page_set::steal_for(&self.page_table, self.page_set, self.id, offset) {
                self.monitor.unlock();
                return Ok(idx);
            }
            self.monitor.unlock();
            self.flush()?;
            self.page_table.wait_for_memory()?;
        }
    }

    /// Pageable `get`: fills and returns the resident page covering `offset`
    /// as a pte, holding the reference [`Cache::get_page`] took until the
    /// matching [`Cache::put`]. Mirrors `Cache::get` (`IPageable::get`).
    pub fn get(&self, offset: i64) -> KResult<u64> {
        let idx = self.get_page(offset)?;
        let page = self.page_table.page(idx);
        page.fill(self.store.as_ref())?;
        Ok(encode_pte(idx))
    }

    /// Pageable `put`: releases the reference a matching [`Cache::get`] took,
    /// writing the page back first if the caller marks `pte` dirty. `offset`
    /// is accepted for interface symmetry with `get` but unused, matching
    /// the original (a pte alone identifies its page). Mirrors `Cache::put`.
    pub fn put(&self, _offset: i64, pte: u64) -> KResult<()> {
        let Some(idx) = decode_pte(pte) else {
            return Ok(());
        };
        if pte & PTE_DIRTY != 0 {
            let page = self.page_table.page(idx);
            page.sync(self.store.as_ref(), self.sector_size)?;
            page.touch();
        }
        self.release_page(idx);
        Ok(())
    }

    pub fn read(&self, dst: &mut [u8], offset: i64) -> KResult<usize> {
        let mut done = 0;
        while done < dst.len() {
            let cur = offset + done as i64;
            if cur >= self.size.load(Ordering::Acquire) {
                break;
            }
            let idx = self.get_page(cur)?;
            let page = self.page_table.page(idx);
            page.fill(self.store.as_ref())?;
            let page_off = (cur - align_down(cur, PAGE_SIZE)) as usize;
            let avail_in_page = PAGE_SIZE - page_off;
            let avail_in_cache = (self.size.load(Ordering::Acquire) - cur) as usize;
            let n = (dst.len() - done).min(avail_in_page).min(avail_in_cache);
            page.read_local(page_off, &mut dst[done..done + n]);
            self.release_page(idx);
            done += n;
        }
        Ok(done)
    }

    pub fn write(&self, src: &[u8], offset: i64) -> KResult<usize> {
        let end = offset + src.len() as i64;
        if end > self.size.load(Ordering::Acquire) {
            self.set_size(end)?;
        }
        let mut done = 0;
        while done < src.len() {
            let cur = offset + done as i64;
            let idx = self.get_page(cur)?;
            let page = self.page_table.page(idx);
            let page_off = (cur - align_down(cur, PAGE_SIZE)) as usize;
            let n = (src.len() - done).min(PAGE_SIZE - page_off);
            if page_off != 0 || n != PAGE_SIZE {
                page.fill(self.store.as_ref())?;
            }
            page.write_local(page_off, &src[done..done + n]);
            page.mark_dirty(page_off, n, self.sector_size);
            self.change(idx);
            self.release_page(idx);
            done += n;
        }
        Ok(done)
    }

    /// Marks a page Changed, adding it to this cache's changed list if it
    /// was not already there. Mirrors `Cache::change`.
    fn change(&self, idx: usize) {
        let page = self.page_table.page(idx);
        if !page.is_changed() {
            page.set_changed(true);
            page.add_ref();
            page.touch();
            self.changed.lock().unwrap().push(idx);
        }
    }

    /// Drops a caller's reference to a resident page, routing it to its page
    /// set's standby list once nothing (including the changed list) holds
    /// it any longer. Mirrors the refcount-reaches-zero half of
    /// `Page::release` in the original, which is folded into the page
    /// itself there but belongs here since only `Cache` knows which page
    /// set a page came from.
    fn release_page(&self, idx: usize) {
        let page = self.page_table.page(idx);
        if page.release() == 0 && !page.is_changed() {
            if let Some(set_id) = page.page_set() {
                crate::page::page_set::standby(&self.page_table, set_id, idx);
            }
        }
    }

    /// Clears Changed on a page once its dirty bytes are durable. Mirrors
    /// `Cache::clean(page)`.
    fn clean_page(&self, idx: usize) {
        let page = self.page_table.page(idx);
        page.set_changed(false);
        self.changed.lock().unwrap().retain(|&p| p != idx);
        self.release_page(idx);
    }

    /// Grows or shrinks the cache's logical size, freeing any page beyond
    /// the new size. Mirrors `Cache::setSize`.
    pub fn set_size(&self, new_size: i64) -> KResult<()> {
        if new_size < 0 {
            return Err(ErrNO::InvalidArgs);
        }
        self.monitor.lock()?;
        let old_size = self.size.load(Ordering::Acquire);
        self.store.set_size(new_size)?;
        self.size.store(new_size, Ordering::Release);
        if new_size < old_size {
            let mut off = align_down(new_size, PAGE_SIZE);
            if off < new_size {
                off += PAGE_SIZE as i64;
            }
            while off < old_size {
                if let Some(idx) = self.page_table.lookup(self.id, off) {
                    crate::page::page_set::free(&self.page_table, self.page_set, idx);
                }
                off += PAGE_SIZE as i64;
            }
        }
        self.monitor.unlock();
        Ok(())
    }

    /// Writes back every changed page, leaving the changed list empty.
    /// Mirrors `Cache::flush`.
    pub fn flush(&self) -> KResult<()> {
        loop {
            let idx = {
                let changed = self.changed.lock().unwrap();
                match changed.first().copied() {
                    Some(i) => i,
                    None => break,
                }
            };
            let page = self.page_table.page(idx);
            page.sync(self.store.as_ref(), self.sector_size)?;
            self.clean_page(idx);
        }
        self.store.flush()
    }

    /// Aging pass: writes back only pages stale for at least
    /// `DELAYED_WRITE_SECONDS`, or all of them when `force` is set (low
    /// memory). Mirrors `Cache::clean()`.
    pub fn clean(&self, force: bool) -> KResult<()> {
        let threshold_millis = DELAYED_WRITE_SECONDS * 1000;
        let candidates: Vec<usize> = {
            let changed = self.changed.lock().unwrap();
            changed
                .iter()
                .copied()
                .filter(|&idx| force || self.page_table.page(idx).is_stale(threshold_millis))
                .collect()
        };
        for idx in candidates {
            let page = self.page_table.page(idx);
            page.sync(self.store.as_ref(), self.sector_size)?;
            self.clean_page(idx);
        }
        Ok(())
    }

    /// Drops every changed page without writing it back.
    pub fn invalidate(&self) {
        let idxs: Vec<usize> = self.changed.lock().unwrap().drain(..).collect();
        for idx in idxs {
            self.page_table.page(idx).set_changed(false);
            self.release_page(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backing_store::MemoryBackingStore;

    fn fresh_cache() -> Arc<Cache> {
        let table = Arc::new(PageTable::new(64));
        let store: Arc<dyn BackingStore> = Arc::new(MemoryBackingStore::new());
        Cache::new(store, table, crate::page::page_table::ROOT_SET).unwrap()
    }

    #[test]
    fn small_read_write_round_trip() {
        let cache = fresh_cache();
        let pattern: Vec<u8> = (b'A'..=b'H').collect();
        cache.write(&pattern, 0).unwrap();
        cache.flush().unwrap();
        let mut out = vec![0u8; pattern.len()];
        cache.read(&mut out, 0).unwrap();
        assert_eq!(out, pattern);
    }

    #[test]
    fn page_boundary_write_round_trip() {
        let cache = fresh_cache();
        let len = 5000usize;
        let pattern: Vec<u8> = (0..len).map(|i| b'A' + ((len - i) % 26) as u8).collect();
        cache.write(&pattern, 3000).unwrap();
        cache.flush().unwrap();
        let mut out = vec![0u8; len];
        cache.read(&mut out, 3000).unwrap();
        assert_eq!(out, pattern);
    }

    #[test]
    fn flush_empties_changed_list() {
        let cache = fresh_cache();
        cache.write(b"hello", 0).unwrap();
        assert!(cache.has_changed_pages());
        cache.flush().unwrap();
        assert!(!cache.has_changed_pages());
    }

    #[test]
    fn pageable_get_put_round_trip() {
        let cache = fresh_cache();
        cache.write(b"hello", 0).unwrap();
        let pte = cache.get(0).unwrap();
        assert_ne!(pte & PTE_VALID, 0);
        cache.put(0, pte | PTE_DIRTY).unwrap();
        let mut out = vec![0u8; 5];
        cache.read(&mut out, 0).unwrap();
        assert_eq!(&out, b"hello");
    }
}
