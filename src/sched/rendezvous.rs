/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! Priority-ordered wait queue, used both by the scheduler's run queues and
//! by [`crate::sched::monitor::Monitor`] for lock contention and condition
//! waits.
//!
//! Grounded on `original_source` `os/kernel/include/thread.h`
//! (`Thread::Rendezvous`, `Thread::Queue::addPrio`): threads are queued in
//! descending-priority order, FIFO among equals, and `sleep`/`wakeup` move
//! a thread on and off the queue while it blocks on its own parker.

use std::sync::Mutex;

use crate::sched::thread::{current, ThreadControl, ThreadId};
use std::sync::Arc;

struct Entry {
    id: ThreadId,
    control: Arc<ThreadControl>,
}

pub struct Rendezvous {
    waiters: Mutex<Vec<Entry>>,
}

impl Rendezvous {
    pub const fn new() -> Self {
        Self { waiters: Mutex::new(Vec::new()) }
    }

    fn insert_by_priority(waiters: &mut Vec<Entry>, entry: Entry) {
        let prio = entry.control.effective_priority();
        let pos = waiters
            .iter()
            .position(|e| e.control.effective_priority() < prio)
            .unwrap_or(waiters.len());
        waiters.insert(pos, entry);
    }

    /// Enqueues the calling thread and parks it. Returns once [`wakeup`] or
    /// [`remove`] has released it.
    pub fn sleep(&self) {
        self.enqueue();
        current().park();
    }

    /// Enqueues the calling thread without parking. Callers that must check
    /// a release condition and enqueue as one atomic step (to avoid a lost
    /// wakeup if the release races the enqueue) call this while still
    /// holding whatever lock guards that condition, then park separately
    /// once it is safe to drop that lock.
    pub fn enqueue(&self) {
        let me = current();
        let mut waiters = self.waiters.lock().unwrap();
        Self::insert_by_priority(&mut waiters, Entry { id: me.id, control: me.clone() });
    }

    /// Wakes the highest-priority waiter, if any. Returns its id.
    pub fn wakeup(&self) -> Option<ThreadId> {
        let mut waiters = self.waiters.lock().unwrap();
        if waiters.is_empty() {
            return None;
        }
        let entry = waiters.remove(0);
        entry.control.unpark();
        Some(entry.id)
    }

    /// Wakes every waiter.
    pub fn wakeup_all(&self) {
        let mut waiters = self.waiters.lock().unwrap();
        for e in waiters.drain(..) {
            e.control.unpark();
        }
    }

    /// Removes a specific thread from the queue without waking it through
    /// the normal path (used when a timed wait's alarm fires first).
    pub fn remove(&self, id: ThreadId) -> bool {
        let mut waiters = self.waiters.lock().unwrap();
        if let Some(pos) = waiters.iter().position(|e| e.id == id) {
            waiters.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }

    /// Highest priority currently queued, used by a monitor owner's
    /// priority-inheritance recomputation.
    pub fn highest_priority(&self) -> Option<u32> {
        self.waiters.lock().unwrap().first().map(|e| e.control.effective_priority())
    }
}
