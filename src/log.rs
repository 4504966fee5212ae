//! Logging utils. See ["log" crate documentation](https://docs.rs/log/) for details.
//!
//! The runtime logs through the `log` facade only. [`StderrLogger`] is a
//! minimal implementation for binaries and tests that do not bring their
//! own; the max level comes from the `FIBERIO_LOG` environment variable
//! (`error`, `warn`, `info`, `debug`, `trace`; default `warn`).
//!
//! Example:
//! ```no_run
//! fiberio::log::init();
//! log::info!("runtime starting");
//! ```

use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record};

use crate::clock;

/// [Log](https://docs.rs/log/latest/log/trait.Log.html) trait implementation
/// writing `time level target — message` lines to stderr.
pub struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let ms = clock::now_ms();
        let mut err = std::io::stderr().lock();
        let _ = writeln!(
            err,
            "{}.{:03} {:5} {}: {}",
            ms / 1000,
            ms % 1000,
            record.level(),
            record.target(),
            record.args(),
        );
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

/// Install [`StderrLogger`] with the level taken from `FIBERIO_LOG`.
/// Does nothing if a logger is already installed.
pub fn init() {
    init_with_level(level_from_env());
}

/// Install [`StderrLogger`] with an explicit max level.
/// Does nothing if a logger is already installed.
pub fn init_with_level(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn level_from_env() -> LevelFilter {
    match std::env::var("FIBERIO_LOG").as_deref() {
        Ok("error") => LevelFilter::Error,
        Ok("warn") => LevelFilter::Warn,
        Ok("info") => LevelFilter::Info,
        Ok("debug") => LevelFilter::Debug,
        Ok("trace") => LevelFilter::Trace,
        Ok("off") => LevelFilter::Off,
        _ => LevelFilter::Warn,
    }
}
