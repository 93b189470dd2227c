//! `log` facade backend
//!
//! Formats records onto the serial port. Installed once, early in boot;
//! before that, log records vanish silently, which is fine — there is
//! nowhere to put them yet.

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::serial::SERIAL;
use crate::sync::InterruptGuard;

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _guard = InterruptGuard::acquire();
        let mut serial = SERIAL.lock();
        let _ = writeln!(
            serial,
            "[{:>5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}
