/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! Page-pool steal scenario (spec testable-properties scenario 6): a
//! cache with more dirty pages than the pool has frames must still be
//! able to allocate a fresh page, either by reclaiming a clean standby
//! page or by having the writeback thread flush a dirty one, without
//! deadlocking.

use std::sync::Arc;
use std::time::Duration;

use kernel::cache::backing_store::{BackingStore, MemoryBackingStore};
use kernel::config::PAGE_SIZE;
use kernel::page::page_table::ROOT_SET;

#[test]
fn allocating_beyond_pool_capacity_reclaims_via_writeback() {
    let _ = env_logger::try_init();
    let (table, factory, writeback) = kernel::bootstrap(4);
    let store: Arc<dyn BackingStore> = Arc::new(MemoryBackingStore::new());
    let cache = factory.create_instance(store, ROOT_SET).unwrap();

    // Write to more page-aligned offsets than the pool has frames, so every
    // page starts out dirty and none can be reclaimed as standby until the
    // writeback thread (or an explicit flush) catches up.
    for i in 0..8u64 {
        let offset = (i as i64) * PAGE_SIZE as i64;
        let buf = vec![i as u8; 16];
        cache.write(&buf, offset).unwrap();
    }

    assert_eq!(table.num_pages(), 4);

    // Give the writeback thread a chance to clean some pages so further
    // allocation has somewhere to reclaim from.
    std::thread::sleep(Duration::from_millis(200));

    let fresh_offset = 9 * PAGE_SIZE as i64;
    let result = cache.write(b"fresh", fresh_offset);
    assert!(result.is_ok(), "allocation beyond capacity must succeed via reclaim, got {:?}", result);

    factory.request_stop();
    let _ = writeback;
}
