use std::io::Write as _;

use lazy_static::lazy_static;
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Kernel console: the hosted stand-in for the UART, writing to the host's stderr.
pub struct Console {
    bytes_written: usize,
}

impl Console {
    pub const fn new() -> Console {
        Console { bytes_written: 0 }
    }

    pub fn send(&mut self, data: &[u8]) {
        // A closed stderr is not a kernel error.
        let _ = std::io::stderr().write_all(data);
        self.bytes_written += data.len();
    }

    /// Total bytes pushed through the console since boot.
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }
}

impl Default for Console {
    fn default() -> Self {
        Console::new()
    }
}

impl core::fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.send(s.as_bytes());
        Ok(())
    }
}

lazy_static! {
    pub static ref CONSOLE: Mutex<Console> = Mutex::new(Console::new());
}

/// `log` backend that prefixes every record with its level, one line per record.
struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // One lock hold per line so records from different cores never interleave.
        let mut console = CONSOLE.lock();
        let _ = core::fmt::Write::write_fmt(
            &mut *console,
            format_args!("[{}] {}\n", record.level(), record.args()),
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the console logger. Safe to call more than once; later calls only
/// adjust the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_counts_bytes() {
        let mut console = Console::new();
        core::fmt::Write::write_str(&mut console, "hello\n").unwrap();
        assert_eq!(console.bytes_written(), 6);
    }

    #[test]
    fn init_is_idempotent() {
        init(LevelFilter::Warn);
        init(LevelFilter::Error);
        assert_eq!(log::max_level(), LevelFilter::Error);
        init(LevelFilter::Warn);
    }
}
