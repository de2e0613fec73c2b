/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! Priority-inversion avoidance, grounded on `original_source`
//! `os/kernel/testsuite/bpi2.cpp` and `bpi3.cpp`: a low-priority thread
//! holds a monitor while a higher-priority thread blocks on it; the low
//! priority thread must have its effective priority raised to at least the
//! blocker's for the duration of the contention, and restored to its base
//! once it releases. `bpi3.cpp` additionally cancels the blocked thread
//! mid-wait and expects it to unwind without ever having acquired the
//! monitor.
//!
//! These tests assert the effective-priority invariant directly rather
//! than reproducing the original's three-thread wall-clock completion
//! order: this crate's kernel threads are real OS threads scheduled by the
//! host, not routed through `Scheduler`'s own run queues, so a
//! host-scheduling race cannot be asserted on deterministically. See
//! `DESIGN.md` for the open-question resolution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kernel::sched::{monitor::Monitor, thread};

#[test]
fn bpi2_low_priority_holder_inherits_blocker_priority() {
    let _ = env_logger::try_init();
    let monitor = Arc::new(Monitor::new());
    let may_release = Arc::new(AtomicBool::new(false));

    let m = monitor.clone();
    let release = may_release.clone();
    let lo = thread::spawn("lo", 5, move || {
        m.lock().unwrap();
        while !release.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(2));
        }
        m.unlock();
    });

    std::thread::sleep(Duration::from_millis(20));
    let lo_ctrl = lo.control();
    assert_eq!(lo_ctrl.effective_priority(), 5, "lo should start at its base priority");

    let m2 = monitor.clone();
    let hi = thread::spawn("hi", 20, move || {
        m2.lock().unwrap();
        m2.unlock();
    });

    // Give `hi` time to block on the monitor and propagate inheritance.
    std::thread::sleep(Duration::from_millis(60));
    assert!(
        lo_ctrl.effective_priority() >= 20,
        "lo's effective priority ({}) should be raised to hi's (20) while hi is blocked",
        lo_ctrl.effective_priority()
    );

    may_release.store(true, Ordering::SeqCst);
    lo.join();
    hi.join();

    assert_eq!(lo_ctrl.effective_priority(), 5, "lo should return to its base priority after releasing");
}

#[test]
fn bpi3_cancellation_while_blocked_releases_nothing() {
    let _ = env_logger::try_init();
    let monitor = Arc::new(Monitor::new());
    let may_release = Arc::new(AtomicBool::new(false));

    let m = monitor.clone();
    let release = may_release.clone();
    let lo = thread::spawn("lo", 5, move || {
        m.lock().unwrap();
        while !release.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(2));
        }
        m.unlock();
    });

    std::thread::sleep(Duration::from_millis(20));

    let m2 = monitor.clone();
    let mid = thread::spawn("mid", 15, move || {
        let _ = m2.lock();
    });

    std::thread::sleep(Duration::from_millis(20));
    mid.control().request_cancel();

    // `mid` should observe cancellation inside its blocked `lock()` call
    // and return without ever holding the monitor.
    std::thread::sleep(Duration::from_millis(60));
    may_release.store(true, Ordering::SeqCst);
    lo.join();

    assert!(!monitor.is_locked(), "monitor must be free once lo released and mid never acquired it");

    // A third thread must still be able to acquire cleanly afterward.
    let m3 = monitor.clone();
    let after = thread::spawn("after", 10, move || {
        m3.lock().unwrap();
        m3.unlock();
    });
    after.join();
    assert!(!monitor.is_locked());

    mid.join();
}
