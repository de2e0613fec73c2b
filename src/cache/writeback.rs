/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! The cache factory and its writeback housekeeping thread.
//!
//! Grounded on `original_source`
//! `neeraj/trunk/.../port/cacheFactory.cpp`: `Cache::Constructor` both
//! mints new `Cache` instances and owns a background thread that scans a
//! list of caches with outstanding changed pages, takes each one's monitor
//! without blocking (yielding on contention), and calls `clean()`. This
//! crate's factory tracks every cache it has ever created rather than
//! maintaining separate standby/changed cache lists, a simplification
//! noted in `DESIGN.md`.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::cache::backing_store::BackingStore;
use crate::cache::cache::Cache;
use crate::config::{TICK_MILLIS, WRITEBACK_THREAD_PRIORITY};
use crate::page::page_table::{PageSetId, PageTable};
use crate::sched::thread::ThreadHandle;

pub struct CacheFactory {
    page_table: Arc<PageTable>,
    caches: Mutex<Vec<Weak<Cache>>>,
    stop: std::sync::atomic::AtomicBool,
}

impl CacheFactory {
    /// Creates the factory and starts its writeback thread, exactly as
    /// `Cache::Constructor::Constructor()` spawns `thread.start()` at
    /// `Thread::Normal` priority.
    pub fn start(page_table: Arc<PageTable>) -> (Arc<Self>, ThreadHandle) {
        let factory = Arc::new(Self {
            page_table,
            caches: Mutex::new(Vec::new()),
            stop: std::sync::atomic::AtomicBool::new(false),
        });
        let worker = factory.clone();
        let handle = crate::sched::thread::spawn("writeback", WRITEBACK_THREAD_PRIORITY, move || {
            worker.run();
        });
        (factory, handle)
    }

    pub fn create_instance(
        self: &Arc<Self>,
        store: Arc<dyn BackingStore>,
        page_set: PageSetId,
    ) -> crate::errors::KResult<Arc<Cache>> {
        let cache = Cache::new(store, self.page_table.clone(), page_set)?;
        self.caches.lock().unwrap().push(Arc::downgrade(&cache));
        Ok(cache)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn run(&self) {
        while !self.stop.load(std::sync::atomic::Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(TICK_MILLIS * 5));
            let mut any_dirty = false;
            let caches: Vec<Arc<Cache>> = {
                let mut guard = self.caches.lock().unwrap();
                guard.retain(|w| w.strong_count() > 0);
                guard.iter().filter_map(Weak::upgrade).collect()
            };
            for cache in caches {
                if !cache.has_changed_pages() {
                    continue;
                }
                any_dirty = true;
                if cache.monitor.try_lock() {
                    let _ = cache.clean(false);
                    cache.monitor.unlock();
                } else {
                    std::thread::yield_now();
                }
            }
            if !any_dirty {
                self.page_table.notify_memory();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backing_store::MemoryBackingStore;
    use crate::page::page_table::ROOT_SET;

    #[test]
    fn factory_creates_tracked_caches() {
        let table = Arc::new(PageTable::new(32));
        let (factory, _writeback) = CacheFactory::start(table);
        let store: Arc<dyn BackingStore> = Arc::new(MemoryBackingStore::new());
        let cache = factory.create_instance(store, ROOT_SET).unwrap();
        cache.write(b"hi", 0).unwrap();
        assert!(cache.has_changed_pages());
        factory.request_stop();
    }
}
