/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! Spinlocks and interrupt-priority levels.
//!
//! Grounded on the teacher's `RawSpinLock` (bare `AtomicU32` test-and-set)
//! for the underlying primitive, and on `original_source`
//! `os/kernel/include/spinlock.h` for the two shapes a caller actually
//! wants: a non-reentrant tight `Lock`, and a `SpinLock` that additionally
//! records its owner and a recursion count. Both carry a nested
//! `Synchronized` RAII guard exactly as the original does.
//!
//! IPL is modeled per-thread (standing in for per-CPU, since every kernel
//! thread here is a host thread bound to one simulated CPU for its
//! lifetime): `Idle < Lo < Hi`. Raising and lowering is strictly
//! stack-ordered; `spl_hi` returns the prior level for `spl_x` to restore.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

pub const ARCH_SPIN_LOCK_UNLOCKED: u32 = 0;
pub const ARCH_SPIN_LOCK_LOCKED: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Ipl {
    Idle = 0,
    Lo = 1,
    Hi = 2,
}

thread_local! {
    static CURRENT_IPL: Cell<Ipl> = Cell::new(Ipl::Idle);
}

/// Raises the calling thread's IPL to at least `Hi` and returns the prior
/// level, for `spl_x` to restore. Never lowers.
pub fn spl_hi() -> Ipl {
    CURRENT_IPL.with(|ipl| {
        let prior = ipl.get();
        if prior < Ipl::Hi {
            ipl.set(Ipl::Hi);
        }
        prior
    })
}

/// Restores a previously saved IPL.
pub fn spl_x(prior: Ipl) {
    CURRENT_IPL.with(|ipl| ipl.set(prior));
}

pub fn current_ipl() -> Ipl {
    CURRENT_IPL.with(|ipl| ipl.get())
}

/// A bare test-and-set lock. Never reentrant: a second `lock()` call by the
/// current holder spins forever, matching the original `Lock` class.
pub struct Lock {
    raw: AtomicU32,
}

impl Lock {
    pub const fn new() -> Self {
        Self { raw: AtomicU32::new(ARCH_SPIN_LOCK_UNLOCKED) }
    }

    pub fn lock(&self) -> Ipl {
        let prior = spl_hi();
        while self
            .raw
            .compare_exchange_weak(
                ARCH_SPIN_LOCK_UNLOCKED,
                ARCH_SPIN_LOCK_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            std::hint::spin_loop();
        }
        prior
    }

    pub fn try_lock(&self) -> Option<Ipl> {
        let prior = spl_hi();
        if self
            .raw
            .compare_exchange(
                ARCH_SPIN_LOCK_UNLOCKED,
                ARCH_SPIN_LOCK_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            Some(prior)
        } else {
            spl_x(prior);
            None
        }
    }

    pub fn unlock(&self, prior: Ipl) {
        self.raw.store(ARCH_SPIN_LOCK_UNLOCKED, Ordering::Release);
        spl_x(prior);
    }

    /// RAII guard mirroring the original's nested `Synchronized` class.
    pub fn synchronized(&self) -> Synchronized<'_> {
        let prior = self.lock();
        Synchronized { lock: self, prior: Some(prior) }
    }
}

pub struct Synchronized<'a> {
    lock: &'a Lock,
    prior: Option<Ipl>,
}

impl<'a> Drop for Synchronized<'a> {
    fn drop(&mut self) {
        if let Some(prior) = self.prior.take() {
            self.lock.unlock(prior);
        }
    }
}

/// A unique id identifying the calling thread for spinlock ownership
/// bookkeeping, independent of the scheduler's own `ThreadId`.
fn raw_thread_id() -> usize {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    (hasher.finish() as usize) | 1
}

const NO_OWNER: usize = 0;

/// A reentrant spinlock: records owner and recursion count, matching
/// `original_source` `SpinLock` (`spinlock.h`). A holder may reacquire; a
/// non-holder spins.
pub struct SpinLock {
    inner: Lock,
    owner: AtomicUsize,
    count: AtomicUsize,
    saved_ipl: Cell<Option<Ipl>>,
}

unsafe impl Sync for SpinLock {}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            inner: Lock::new(),
            owner: AtomicUsize::new(NO_OWNER),
            count: AtomicUsize::new(0),
            saved_ipl: Cell::new(None),
        }
    }

    pub fn lock(&self) {
        let me = raw_thread_id();
        if self.owner.load(Ordering::Acquire) == me {
            self.count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let prior = self.inner.lock();
        self.owner.store(me, Ordering::Release);
        self.count.store(1, Ordering::Relaxed);
        self.saved_ipl.set(Some(prior));
    }

    pub fn unlock(&self) {
        let me = raw_thread_id();
        debug_assert_eq!(self.owner.load(Ordering::Relaxed), me, "unlock by non-owner");
        let left = self.count.fetch_sub(1, Ordering::Relaxed) - 1;
        if left == 0 {
            self.owner.store(NO_OWNER, Ordering::Release);
            if let Some(prior) = self.saved_ipl.take() {
                self.inner.unlock(prior);
            }
        }
    }

    pub fn synchronized(&self) -> SpinLockGuard<'_> {
        self.lock();
        SpinLockGuard { lock: self }
    }
}

pub struct SpinLockGuard<'a> {
    lock: &'a SpinLock,
}

impl<'a> Drop for SpinLockGuard<'a> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
