/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! Kernel thread control blocks.
//!
//! Grounded on the teacher's `thread.rs` (`ThreadInfo`, `TaskState`,
//! priority constants, `thread_get_current`/`thread_set_current`) and on
//! `original_source` `os/kernel/include/thread.h` for the fields that
//! matter here: priority, effective priority, held-monitor list,
//! cancellation state. The teacher reads its current-thread pointer out of
//! the `tp` register via inline `asm!`; hosted on `std`, the equivalent is
//! a thread-local holding an `Arc<ThreadControl>` installed when the
//! kernel spawns the underlying `std::thread`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use crate::config::{DEFAULT_PRIORITY, NUM_PRIORITIES};

pub type ThreadId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Runnable,
    Running,
    Waiting,
    TimedWaiting,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelType {
    Deferred,
    Asynchronous,
}

/// The thread control block. `Arc`-shared so the scheduler, any monitor a
/// thread blocks on, and the thread's own thread-local can all refer to the
/// same instance.
pub struct ThreadControl {
    pub id: ThreadId,
    pub name: String,
    base_priority: AtomicU32,
    effective_priority: AtomicU32,
    state: Mutex<ThreadState>,
    /// Monitors currently held by this thread, in acquisition order — the
    /// stack `unlock-on-cancel` walks in reverse, matching the spec's
    /// stack-order release rule.
    pub held_monitors: Mutex<Vec<u64>>,
    cancel_requested: AtomicBool,
    cancel_state_enabled: AtomicBool,
    cancel_type: Mutex<CancelType>,
    park_mutex: Mutex<bool>,
    park_cv: Condvar,
}

impl ThreadControl {
    fn new(id: ThreadId, name: String, priority: u32) -> Self {
        Self {
            id,
            name,
            base_priority: AtomicU32::new(priority),
            effective_priority: AtomicU32::new(priority),
            state: Mutex::new(ThreadState::Runnable),
            held_monitors: Mutex::new(Vec::new()),
            cancel_requested: AtomicBool::new(false),
            cancel_state_enabled: AtomicBool::new(true),
            cancel_type: Mutex::new(CancelType::Deferred),
            park_mutex: Mutex::new(false),
            park_cv: Condvar::new(),
        }
    }

    pub fn base_priority(&self) -> u32 {
        self.base_priority.load(Ordering::Relaxed)
    }

    pub fn effective_priority(&self) -> u32 {
        self.effective_priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, prio: u32) {
        self.base_priority.store(prio, Ordering::Relaxed);
        self.reset_priority();
    }

    /// Recomputes effective priority as `max(base, max over held monitors of
    /// their highest waiter)`, matching `original_source` thread.h's
    /// `resetPriority`/`updatePriority` split: monitor bookkeeping lives on
    /// the thread, triggered by `Monitor::update`, not on the monitor.
    pub fn reset_priority(&self) {
        self.effective_priority.store(self.base_priority(), Ordering::Relaxed);
    }

    pub fn raise_effective_priority(&self, candidate: u32) {
        let mut cur = self.effective_priority.load(Ordering::Relaxed);
        while candidate > cur {
            match self.effective_priority.compare_exchange_weak(
                cur,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Sets effective priority directly, used by
    /// [`crate::sched::monitor::recompute_priority`] after walking every
    /// monitor this thread still holds.
    pub fn set_effective_priority(&self, value: u32) {
        self.effective_priority.store(value, Ordering::Relaxed);
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, s: ThreadState) {
        *self.state.lock().unwrap() = s;
    }

    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        let mut guard = self.park_mutex.lock().unwrap();
        *guard = true;
        self.park_cv.notify_all();
    }

    pub fn set_cancel_enabled(&self, enabled: bool) {
        self.cancel_state_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_cancel_type(&self, ty: CancelType) {
        *self.cancel_type.lock().unwrap() = ty;
    }

    /// Called at every suspension-capable point per the concurrency model's
    /// cancellation rule. Returns `true` exactly once per pending cancel.
    pub fn test_cancel(&self) -> bool {
        self.cancel_state_enabled.load(Ordering::SeqCst)
            && self.cancel_requested.swap(false, Ordering::SeqCst)
    }

    pub fn park(&self) {
        let mut guard = self.park_mutex.lock().unwrap();
        while !*guard {
            guard = self.park_cv.wait(guard).unwrap();
        }
        *guard = false;
    }

    pub fn unpark(&self) {
        let mut guard = self.park_mutex.lock().unwrap();
        *guard = true;
        self.park_cv.notify_one();
    }
}

struct Registry {
    threads: Mutex<HashMap<ThreadId, Arc<ThreadControl>>>,
    next_id: AtomicU64,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry { threads: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) })
}

thread_local! {
    static CURRENT: std::cell::RefCell<Option<Arc<ThreadControl>>> = std::cell::RefCell::new(None);
}

/// A registered kernel thread. Dropping the handle does not terminate the
/// underlying thread; join it explicitly via [`ThreadHandle::join`].
pub struct ThreadHandle {
    pub control: Arc<ThreadControl>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl ThreadHandle {
    pub fn id(&self) -> ThreadId {
        self.control.id
    }

    pub fn join(mut self) {
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn control(&self) -> Arc<ThreadControl> {
        self.control.clone()
    }
}

/// Spawns a kernel thread at the given base priority, installing its
/// `ThreadControl` as the thread-local `current()` before running `body`.
/// Mirrors `Thread::start`/`thread_set_current` from the teacher/original.
pub fn spawn<F>(name: impl Into<String>, priority: u32, body: F) -> ThreadHandle
where
    F: FnOnce() + Send + 'static,
{
    let name = name.into();
    let id = registry().next_id.fetch_add(1, Ordering::Relaxed);
    let control = Arc::new(ThreadControl::new(id, name.clone(), priority.min(NUM_PRIORITIES as u32 - 1)));
    registry().threads.lock().unwrap().insert(id, control.clone());

    let thread_control = control.clone();
    let join = std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            CURRENT.with(|c| *c.borrow_mut() = Some(thread_control.clone()));
            thread_control.set_state(ThreadState::Running);
            body();
            thread_control.set_state(ThreadState::Terminated);
            registry().threads.lock().unwrap().remove(&thread_control.id);
        })
        .expect("failed to spawn kernel thread");

    ThreadHandle { control, join: Some(join) }
}

/// The calling host thread's kernel `ThreadControl`, if it was created via
/// [`spawn`]. Threads not spawned through the kernel (e.g. the test
/// harness's own main thread) get a lazily-registered default-priority
/// control the first time this is called.
pub fn current() -> Arc<ThreadControl> {
    if let Some(existing) = CURRENT.with(|c| c.borrow().clone()) {
        return existing;
    }
    let id = registry().next_id.fetch_add(1, Ordering::Relaxed);
    let control = Arc::new(ThreadControl::new(id, "unregistered".into(), DEFAULT_PRIORITY));
    registry().threads.lock().unwrap().insert(id, control.clone());
    CURRENT.with(|c| *c.borrow_mut() = Some(control.clone()));
    control
}

pub fn lookup(id: ThreadId) -> Option<Arc<ThreadControl>> {
    registry().threads.lock().unwrap().get(&id).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_cancel_wakes_a_parked_thread() {
        let ctrl = Arc::new(ThreadControl::new(999, "parked".into(), DEFAULT_PRIORITY));
        let waiter = ctrl.clone();
        let t = std::thread::spawn(move || waiter.park());
        std::thread::sleep(std::time::Duration::from_millis(20));
        ctrl.request_cancel();
        t.join().unwrap();
        assert!(ctrl.test_cancel());
    }
}
