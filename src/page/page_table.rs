/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! The global page descriptor array, the `(cache, offset)` hash table, and
//! the low-memory rendezvous between allocators and the writeback thread.
//!
//! Grounded on `original_source`
//! `neeraj/trunk/.../port/pageTable.cpp`: `init`/`add`/`remove`/`steal`/
//! `lookup(cache, offset)`/`getFreeCount`/`getStandbyCount`/`isLow`/
//! `wait`/`notify`/`sleep`. The descriptor array and the page-set tree are
//! owned by one `PageTable` value here (rather than a lone global), since
//! this crate has no single process-wide singleton to hang them off.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::errors::{ErrNO, KResult};
use crate::page::page::Page;
use crate::page::page_set::PageSetRecord;
use crate::sched::Monitor;

pub type PageSetId = usize;

pub struct PageTable {
    pages: Vec<Page>,
    hash: Mutex<HashMap<(u64, i64), usize>>,
    pub(crate) sets: RwLock<Vec<Mutex<PageSetRecord>>>,
    /// Signalled when the free list transitions empty->nonempty, and waited
    /// on by allocators that found no page available. Mirrors the
    /// `PageTable`-owned monitor used for `wait`/`notify`/`sleep`.
    low_memory: Monitor,
    /// Resident-page count per cache id, maintained here (rather than on
    /// `Cache` itself) because the hash table already learns a page's
    /// cache id on every `add`/`remove`, including reclaims driven by
    /// another cache's `PageSet::steal`.
    cache_counts: Mutex<HashMap<u64, u32>>,
}

pub const ROOT_SET: PageSetId = 0;

impl PageTable {
    /// Builds a page table covering `num_pages` frames, with a single root
    /// page set owning all of them free.
    pub fn new(num_pages: usize) -> Self {
        let pages = (0..num_pages).map(Page::new).collect();
        let root = PageSetRecord::new_root(num_pages);
        let table = Self {
            pages,
            hash: Mutex::new(HashMap::new()),
            sets: RwLock::new(vec![Mutex::new(root)]),
            low_memory: Monitor::new(),
            cache_counts: Mutex::new(HashMap::new()),
        };
        for p in &table.pages {
            p.set_page_set(Some(ROOT_SET));
        }
        {
            let sets = table.sets.read().unwrap();
            let mut root = sets[ROOT_SET].lock().unwrap();
            root.free.extend(0..num_pages);
            root.free_count = num_pages as u64;
        }
        table
    }

    pub fn page(&self, idx: usize) -> &Page {
        &self.pages[idx]
    }

    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Looks up a resident page bound to `(cache, offset)`. On hit,
    /// increments its refcount and, if this is the page's first reference,
    /// removes it from its owning set's standby list.
    pub fn lookup(&self, cache: u64, offset: i64) -> Option<usize> {
        let idx = *self.hash.lock().unwrap().get(&(cache, offset))?;
        let page = &self.pages[idx];
        let was_unreferenced = page.add_ref() == 1;
        if was_unreferenced {
            if let Some(set_id) = page.page_set() {
                let sets = self.sets.read().unwrap();
                let mut rec = sets[set_id].lock().unwrap();
                rec.standby.retain(|&p| p != idx);
            }
        }
        Some(idx)
    }

    pub fn add(&self, idx: usize) {
        let page = &self.pages[idx];
        if let Some(cache) = page.cache_id() {
            self.hash.lock().unwrap().insert((cache, page.offset()), idx);
            *self.cache_counts.lock().unwrap().entry(cache).or_insert(0) += 1;
        }
    }

    pub fn remove(&self, idx: usize) {
        let page = &self.pages[idx];
        if let Some(cache) = page.cache_id() {
            self.hash.lock().unwrap().remove(&(cache, page.offset()));
            let mut counts = self.cache_counts.lock().unwrap();
            if let Some(c) = counts.get_mut(&cache) {
                *c = c.saturating_sub(1);
                if *c == 0 {
                    counts.remove(&cache);
                }
            }
        }
    }

    pub fn cache_page_count(&self, cache: u64) -> u32 {
        *self.cache_counts.lock().unwrap().get(&cache).unwrap_or(&0)
    }

    /// Attempts to reclaim `idx` from the hash table: succeeds only if the
    /// page is otherwise unreferenced.
    pub fn steal(&self, idx: usize) -> bool {
        let page = &self.pages[idx];
        if page.add_ref() == 1 {
            self.remove(idx);
            true
        } else {
            page.release();
            false
        }
    }

    pub fn wait_for_memory(&self) -> KResult<()> {
        self.low_memory.lock()?;
        let r = self.low_memory.wait();
        self.low_memory.unlock();
        r
    }

    pub fn notify_memory(&self) {
        let _ = self.low_memory.lock();
        self.low_memory.notify_all();
        self.low_memory.unlock();
    }

    pub fn get_free_count(&self, set_id: PageSetId) -> u64 {
        let sets = self.sets.read().unwrap();
        sets[set_id].lock().unwrap().free_count
    }

    pub fn get_standby_count(&self, set_id: PageSetId) -> u64 {
        let sets = self.sets.read().unwrap();
        sets[set_id].lock().unwrap().standby_count
    }

    /// Creates a child page set under `parent`, matching `PageSet::fork`.
    pub fn fork_set(&self, parent: PageSetId) -> KResult<PageSetId> {
        {
            let sets = self.sets.read().unwrap();
            if parent >= sets.len() {
                return Err(ErrNO::InvalidArgs);
            }
        }
        let mut sets = self.sets.write().unwrap();
        let id = sets.len();
        sets.push(Mutex::new(PageSetRecord::new_child(parent)));
        Ok(id)
    }
}
