//! Console logger behind the [`log`] facade.
//!
//! The platform hands over a sink (the serial port on hardware, stdout or a
//! buffer on the host) and every crate in the kernel can then use the `log`
//! macros.

use core::fmt::Arguments;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Once;

/// Writes one formatted log line. Must not log itself.
pub type Sink = fn(Arguments<'_>);

pub struct ConsoleLogger {
    sink: Once<Sink>,
}

impl ConsoleLogger {
    pub const fn new() -> Self {
        Self { sink: Once::new() }
    }
}

impl Default for ConsoleLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = self.sink.get() {
            sink(format_args!(
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger::new();

/// Install the console logger, sending every record at or below `max_level`
/// to `sink`.
///
/// Fails if a logger has already been installed.
pub fn init(sink: Sink, max_level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    LOGGER.sink.call_once(|| sink);
    log::set_max_level(max_level);
    Ok(())
}
