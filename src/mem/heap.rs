/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! Bucketed small-object heap layered over an [`Arena`].
//!
//! Grounded on `original_source`
//! `zhou/copyTmp/.../port/heap.cpp`: a fixed set of buckets with
//! doubling cell sizes, each backed by page-sized `Mass` slabs carved from
//! the arena's high end (`allocLast`); large allocations bypass the
//! buckets and go straight to the arena. A `Mass`'s owning bucket is
//! recovered by masking an address down to its page boundary, exactly as
//! the original recovers a cell's owning `Mass`.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::{HEAP_BUCKET_SIZES, PAGE_SIZE};
use crate::errors::{ErrNO, KResult};
use crate::mem::arena::Arena;

struct Mass {
    base: usize,
    cell_size: usize,
    free_cells: Vec<usize>,
    cells_out: usize,
}

struct BucketState {
    masses: Vec<Mass>,
}

/// Heap allocations are addresses in the same coordinate space as the
/// backing [`Arena`] — this crate never touches host memory through them,
/// it only tracks bookkeeping, matching the page-pool's own
/// address-as-identity convention.
pub struct Heap {
    arena: Arena,
    buckets: Vec<Mutex<BucketState>>,
    /// Maps a Mass's page-aligned base to its bucket index, for O(1)
    /// owning-Mass lookup on free.
    mass_index: Mutex<HashMap<usize, usize>>,
    /// Large (non-bucketed) allocations: address -> size, needed because
    /// `Arena::free` requires the original size.
    large: Mutex<HashMap<usize, usize>>,
}

impl Heap {
    pub fn new(arena: Arena) -> Self {
        let buckets = HEAP_BUCKET_SIZES
            .iter()
            .map(|_| Mutex::new(BucketState { masses: Vec::new() }))
            .collect();
        Self { arena, buckets, mass_index: Mutex::new(HashMap::new()), large: Mutex::new(HashMap::new()) }
    }

    fn bucket_for(size: usize) -> Option<usize> {
        HEAP_BUCKET_SIZES.iter().position(|&cell| size <= cell)
    }

    pub fn alloc(&self, size: usize) -> KResult<usize> {
        if size == 0 {
            return Err(ErrNO::InvalidArgs);
        }
        match Self::bucket_for(size) {
            Some(idx) => self.alloc_small(idx),
            None => self.alloc_large(size),
        }
    }

    fn alloc_small(&self, idx: usize) -> KResult<usize> {
        let cell_size = HEAP_BUCKET_SIZES[idx];
        let mut bucket = self.buckets[idx].lock().unwrap();
        if let Some(mass) = bucket.masses.iter_mut().find(|m| !m.free_cells.is_empty()) {
            let off = mass.free_cells.pop().unwrap();
            mass.cells_out += 1;
            return Ok(mass.base + off);
        }
        // No mass has room: carve a fresh page-sized Mass from the arena's
        // high end and populate its free-cell list.
        let base = self.arena.alloc_last(PAGE_SIZE, PAGE_SIZE)?;
        let total_cells = PAGE_SIZE / cell_size;
        let mut free_cells: Vec<usize> = (1..total_cells).map(|i| i * cell_size).collect();
        let taken = free_cells.pop().unwrap_or(0);
        let cells_out = if total_cells > 0 { 1 } else { 0 };
        bucket.masses.push(Mass { base, cell_size, free_cells, cells_out });
        self.mass_index.lock().unwrap().insert(base, idx);
        Ok(base + taken)
    }

    fn alloc_large(&self, size: usize) -> KResult<usize> {
        let addr = self.arena.alloc(size, crate::config::ARENA_ALIGN)?;
        self.large.lock().unwrap().insert(addr, size);
        Ok(addr)
    }

    pub fn free(&self, addr: usize) -> KResult<()> {
        if let Some(size) = self.large.lock().unwrap().remove(&addr) {
            return self.arena.free(addr, size);
        }
        let page_base = addr & !(PAGE_SIZE - 1);
        let idx = *self
            .mass_index
            .lock()
            .unwrap()
            .get(&page_base)
            .ok_or(ErrNO::InvalidArgs)?;
        let mut bucket = self.buckets[idx].lock().unwrap();
        let pos = bucket
            .masses
            .iter()
            .position(|m| m.base == page_base)
            .ok_or(ErrNO::InvalidArgs)?;
        let offset = addr - page_base;
        let mass = &mut bucket.masses[pos];
        mass.free_cells.push(offset);
        mass.cells_out -= 1;
        if mass.cells_out == 0 {
            let mass = bucket.masses.remove(pos);
            self.mass_index.lock().unwrap().remove(&mass.base);
            self.arena.free(mass.base, PAGE_SIZE)?;
        }
        Ok(())
    }

    /// Allocate-copy-free, matching the original `Heap::realloc`. `old_size`
    /// must be the size originally requested (not the bucket's cell size).
    pub fn realloc(&self, addr: usize, old_size: usize, new_size: usize) -> KResult<usize> {
        let new_addr = self.alloc(new_size)?;
        // This heap only tracks addresses, not backing bytes, so there is
        // no payload to copy; callers that need the bytes preserved own
        // the actual storage and perform the copy themselves.
        let _ = old_size;
        self.free(addr)?;
        Ok(new_addr)
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_allocations_round_trip() {
        let heap = Heap::new(Arena::new(0, 64 * PAGE_SIZE));
        let before = heap.arena().size();
        let mut addrs = Vec::new();
        for _ in 0..12 {
            addrs.push(heap.alloc(800).unwrap());
        }
        for a in &addrs {
            assert_eq!(a % crate::config::ARENA_ALIGN, 0);
        }
        for a in addrs {
            heap.free(a).unwrap();
        }
        assert_eq!(heap.arena().size(), before);
    }

    #[test]
    fn large_allocation_bypasses_buckets() {
        let heap = Heap::new(Arena::new(0, 16 * PAGE_SIZE));
        let before = heap.arena().size();
        let a = heap.alloc(PAGE_SIZE).unwrap();
        heap.free(a).unwrap();
        assert_eq!(heap.arena().size(), before);
    }

    #[test]
    fn distinct_allocations_never_alias() {
        let heap = Heap::new(Arena::new(0, 4 * PAGE_SIZE));
        let a = heap.alloc(28).unwrap();
        let b = heap.alloc(28).unwrap();
        assert_ne!(a, b);
    }
}
