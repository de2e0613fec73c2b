/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! Fixed-priority FIFO scheduler.
//!
//! Grounded on `original_source` `os/kernel/port/sched.cpp`: per-priority
//! FIFO run queues, a bitmap of non-empty queues, and `selectThread`
//! picking the highest set bit then popping that queue's head
//! (`Sched::runQueueBits`/`setRun`/`unsetRun`/`selectThread`). The original
//! busy-waits at `Idle` IPL for a bit to appear because it owns real CPUs
//! directly; hosted on `std::thread`, this crate instead gates admission
//! to [`crate::config::NUM_CPUS`] concurrently-running kernel threads
//! through a condvar, so a thread waiting its turn parks instead of
//! spinning the host CPU, while still observing strict priority-then-FIFO
//! ordering at each hand-off.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::config::{NUM_CPUS, NUM_PRIORITIES};
use crate::sched::thread::ThreadId;

struct State {
    queues: Vec<VecDeque<ThreadId>>,
    bitmap: u32,
    free_cpus: usize,
}

impl State {
    fn set_bit(&mut self, prio: usize) {
        self.bitmap |= 1 << prio;
    }
    fn clear_bit_if_empty(&mut self, prio: usize) {
        if self.queues[prio].is_empty() {
            self.bitmap &= !(1 << prio);
        }
    }
    fn highest_nonempty(&self) -> Option<usize> {
        if self.bitmap == 0 {
            None
        } else {
            Some(31 - self.bitmap.leading_zeros() as usize)
        }
    }
}

pub struct Scheduler {
    state: Mutex<State>,
    cv: Condvar,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_cpus(NUM_CPUS)
    }

    pub fn with_cpus(num_cpus: usize) -> Self {
        Self {
            state: Mutex::new(State {
                queues: (0..NUM_PRIORITIES).map(|_| VecDeque::new()).collect(),
                bitmap: 0,
                free_cpus: num_cpus,
            }),
            cv: Condvar::new(),
        }
    }

    /// Marks `tid` runnable at `priority` and blocks until it is both at
    /// the front of the highest-priority non-empty queue and a CPU permit
    /// is free, matching `setRun` followed by a `selectThread` hand-off.
    pub fn acquire_cpu(&self, tid: ThreadId, priority: usize) {
        let priority = priority.min(NUM_PRIORITIES - 1);
        let mut state = self.state.lock().unwrap();
        state.queues[priority].push_back(tid);
        state.set_bit(priority);

        loop {
            let ready = state.free_cpus > 0
                && state.highest_nonempty() == Some(priority)
                && state.queues[priority].front() == Some(&tid);
            if ready {
                state.queues[priority].pop_front();
                state.clear_bit_if_empty(priority);
                state.free_cpus -= 1;
                self.cv.notify_all();
                return;
            }
            state = self.cv.wait(state).unwrap();
        }
    }

    /// Releases the calling thread's CPU permit, matching `unsetRun`
    /// followed by yielding the processor back to the scheduler.
    pub fn release_cpu(&self) {
        let mut state = self.state.lock().unwrap();
        state.free_cpus += 1;
        self.cv.notify_all();
    }

    /// Removes `tid` from its run queue without ever having been granted a
    /// CPU, e.g. because it was cancelled while still waiting to run.
    pub fn unset_run(&self, tid: ThreadId, priority: usize) {
        let priority = priority.min(NUM_PRIORITIES - 1);
        let mut state = self.state.lock().unwrap();
        state.queues[priority].retain(|&id| id != tid);
        state.clear_bit_if_empty(priority);
    }

    pub fn run_queue_len(&self, priority: usize) -> usize {
        self.state.lock().unwrap().queues[priority.min(NUM_PRIORITIES - 1)].len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_runs_first_when_contended() {
        let sched = Scheduler::with_cpus(1);
        sched.acquire_cpu(1, 5);
        sched.release_cpu();
        assert_eq!(sched.run_queue_len(5), 0);
    }

    #[test]
    fn unset_run_drops_queued_thread() {
        let sched = Scheduler::with_cpus(0);
        sched.unset_run(1, 3);
        assert_eq!(sched.run_queue_len(3), 0);
    }
}
