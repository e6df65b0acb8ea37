//! Kernel logger behind the [`log`] facade.
//!
//! Records go to the console registered with [`set_console`] (serial port or
//! video memory on real hardware). Hosted builds fall back to stderr until a
//! console is registered.

use alloc::boxed::Box;
use core::fmt;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use once_cell::race::OnceBox;

/// A line-oriented output device.
pub trait Console: Send + Sync {
    fn write_line(&self, args: fmt::Arguments);
}

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;
static CONSOLE: OnceBox<&'static dyn Console> = OnceBox::new();

fn emit(args: fmt::Arguments) {
    match CONSOLE.get() {
        Some(console) => console.write_line(args),
        #[cfg(not(target_os = "none"))]
        None => std::eprintln!("{}", args),
        #[cfg(target_os = "none")]
        None => {}
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        emit(format_args!(
            "[{:>5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Fails if a logger is already installed.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

/// Route log output to `console`. Only the first registration takes effect;
/// returns `false` if a console was already set.
pub fn set_console(console: &'static dyn Console) -> bool {
    CONSOLE.set(Box::new(console)).is_ok()
}
