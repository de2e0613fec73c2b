/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! One-shot and periodic timers.
//!
//! Grounded on `original_source`
//! `zhou/copyTrunk/.../port/alarm.cpp`: each `Alarm` carries an interval,
//! a start time, enabled/periodic flags, and registers on one of two
//! global queues depending on whether its start time is absolute or
//! relative-to-now. Keeping two queues (rather than collapsing to one)
//! means a wall-clock adjustment only needs to re-sort the absolute queue,
//! per the design notes. A background tick thread stands in for the timer
//! interrupt handler (out of scope here as a device driver) that would
//! otherwise drive `nextTick` comparisons.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use crate::config::TICK_MILLIS;

type Callback = Box<dyn FnMut() + Send + 'static>;

struct Inner {
    id: u64,
    interval: Mutex<Duration>,
    periodic: AtomicBool,
    enabled: AtomicBool,
    callback: Mutex<Option<Callback>>,
    next_fire_relative: Mutex<Option<Instant>>,
    next_fire_absolute: Mutex<Option<SystemTime>>,
}

#[derive(Clone)]
pub struct Alarm {
    inner: Arc<Inner>,
}

struct Queues {
    relative: Vec<Arc<Inner>>,
    absolute: Vec<Arc<Inner>>,
}

fn queues() -> &'static Mutex<Queues> {
    static Q: OnceLock<Mutex<Queues>> = OnceLock::new();
    Q.get_or_init(|| {
        let q = Mutex::new(Queues { relative: Vec::new(), absolute: Vec::new() });
        start_ticker();
        q
    })
}

fn start_ticker() {
    std::thread::Builder::new()
        .name("alarm-ticker".into())
        .spawn(|| loop {
            std::thread::sleep(Duration::from_millis(TICK_MILLIS));
            tick();
        })
        .expect("failed to start alarm ticker");
}

fn tick() {
    let now_instant = Instant::now();
    let now_sys = SystemTime::now();
    let mut due = Vec::new();
    {
        let mut q = match queues().try_lock() {
            Ok(q) => q,
            Err(_) => return,
        };
        q.relative.retain(|alarm| {
            if !alarm.enabled.load(Ordering::SeqCst) {
                return false;
            }
            let fire = *alarm.next_fire_relative.lock().unwrap();
            if fire.map(|f| now_instant >= f).unwrap_or(false) {
                due.push(alarm.clone());
                false
            } else {
                true
            }
        });
        q.absolute.retain(|alarm| {
            if !alarm.enabled.load(Ordering::SeqCst) {
                return false;
            }
            let fire = *alarm.next_fire_absolute.lock().unwrap();
            if fire.map(|f| now_sys >= f).unwrap_or(false) {
                due.push(alarm.clone());
                false
            } else {
                true
            }
        });
    }
    for alarm in due {
        if let Some(cb) = alarm.callback.lock().unwrap().as_mut() {
            cb();
        }
        if alarm.periodic.load(Ordering::SeqCst) {
            let interval = *alarm.interval.lock().unwrap();
            let a = Alarm { inner: alarm };
            a.rearm(interval);
        }
    }
}

fn next_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl Alarm {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: next_id(),
                interval: Mutex::new(Duration::from_secs(0)),
                periodic: AtomicBool::new(false),
                enabled: AtomicBool::new(false),
                callback: Mutex::new(None),
                next_fire_relative: Mutex::new(None),
                next_fire_absolute: Mutex::new(None),
            }),
        }
    }

    pub fn set_callback<F: FnMut() + Send + 'static>(&self, cb: F) {
        *self.inner.callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn set_interval(&self, interval: Duration) {
        *self.inner.interval.lock().unwrap() = interval;
    }

    pub fn set_periodic(&self, periodic: bool) {
        self.inner.periodic.store(periodic, Ordering::SeqCst);
    }

    /// Arms the alarm to fire `interval` from now (relative queue).
    pub fn set_enabled(&self, enabled: bool) {
        if enabled {
            let interval = *self.inner.interval.lock().unwrap();
            self.rearm(interval);
        } else {
            self.cancel();
        }
    }

    /// Arms the alarm against an absolute wall-clock deadline (absolute
    /// queue) instead of a relative interval.
    pub fn set_start_time(&self, at: SystemTime) {
        self.cancel();
        *self.inner.next_fire_absolute.lock().unwrap() = Some(at);
        self.inner.enabled.store(true, Ordering::SeqCst);
        let mut q = queues().lock().unwrap();
        q.absolute.push(self.inner.clone());
    }

    fn rearm(&self, interval: Duration) {
        self.cancel();
        *self.inner.next_fire_relative.lock().unwrap() = Some(Instant::now() + interval);
        self.inner.enabled.store(true, Ordering::SeqCst);
        let mut q = queues().lock().unwrap();
        q.relative.push(self.inner.clone());
    }

    pub fn cancel(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        let mut q = queues().lock().unwrap();
        q.relative.retain(|a| a.id != self.inner.id);
        q.absolute.retain(|a| a.id != self.inner.id);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }
}

impl Default for Alarm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn one_shot_fires_once() {
        let fired = Arc::new(AtomicU32::new(0));
        let alarm = Alarm::new();
        let f = fired.clone();
        alarm.set_callback(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        alarm.set_interval(Duration::from_millis(5));
        alarm.set_enabled(true);
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn periodic_fires_repeatedly() {
        let fired = Arc::new(AtomicU32::new(0));
        let alarm = Alarm::new();
        let f = fired.clone();
        alarm.set_callback(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        alarm.set_interval(Duration::from_millis(10));
        alarm.set_periodic(true);
        alarm.set_enabled(true);
        std::thread::sleep(Duration::from_millis(250));
        alarm.cancel();
        assert!(fired.load(Ordering::SeqCst) >= 2);
    }
}
