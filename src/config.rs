/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! Named constants gathered in one place, the way the teacher's `defines.rs`
//! gathers `PAGE_SIZE`/`PAGE_SHIFT`/`SMP_MAX_CPUS`. There is no board to
//! target here, so these are plain literals rather than values pulled from
//! a generated build-time config module.

#![allow(dead_code)]

/// Size in bytes of one physical page / frame.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Unit of writeback granularity; must divide `PAGE_SIZE`.
pub const DEFAULT_SECTOR_SIZE: usize = 512;

/// How long a page may sit dirty before the writeback thread's aging pass
/// (`Cache::clean()`) considers it stale, in whole seconds.
pub const DELAYED_WRITE_SECONDS: u64 = 15;

/// Number of size-classed buckets in the heap allocator.
pub const HEAP_BUCKET_COUNT: usize = 8;

/// Cell sizes handled by buckets before falling through to the arena
/// directly; doubles roughly every bucket. Capped below `PAGE_SIZE` so
/// every bucket's page-sized `Mass` can carve at least one cell.
pub const HEAP_BUCKET_SIZES: [usize; HEAP_BUCKET_COUNT] =
    [28, 60, 124, 252, 504, 1008, 2016, 4064];

/// Arena cell alignment, matching the original `Arena::ALIGN`.
pub const ARENA_ALIGN: usize = 32;
pub const ARENA_SHIFT: u32 = 5;

/// Fixed priority band: `[0, NUM_PRIORITIES)`, higher is more urgent.
pub const NUM_PRIORITIES: usize = 32;
pub const DEFAULT_PRIORITY: u32 = 16;
pub const HIGHEST_PRIORITY: u32 = (NUM_PRIORITIES - 1) as u32;
pub const LOWEST_PRIORITY: u32 = 0;
pub const WRITEBACK_THREAD_PRIORITY: u32 = DEFAULT_PRIORITY;

/// Number of simulated CPUs backing the scheduler's run-queue fan-out.
pub const NUM_CPUS: usize = 4;

/// Tick period driving the Alarm subsystem's background clock.
pub const TICK_MILLIS: u64 = 10;
