/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

//! A minimal `log::Log` sink, standing in for the teacher's `dprintf!`
//! macro (`debug.rs`) now that subsystems log through the `log` facade
//! instead of a hand-rolled level-gated macro.

use log::{Level, LevelFilter, Metadata, Record};
use spin::Mutex;
use std::io::Write;

struct KernelLogger {
    out: Mutex<()>,
}

static LOGGER: KernelLogger = KernelLogger { out: Mutex::new(()) };

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _guard = self.out.lock();
        let mut stderr = std::io::stderr();
        let _ = writeln!(stderr, "[{:5}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Installs the kernel logger. Idempotent: a second call is a no-op.
pub fn init() {
    let level = std::env::var("KERNEL_LOG")
        .ok()
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
