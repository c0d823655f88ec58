//! Minimal stderr progress/diagnostic logging.
//!
//! Mirrors the corpus's own diagnostic style: no logging framework, a
//! handful of leveled lines on stderr, stdout kept clean for the final
//! success summary.

use std::io::Write;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn prefix(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }

    /// ANSI color code for this level, applied only when stderr is a TTY.
    fn color(self) -> &'static str {
        match self {
            Level::Info => "\x1b[36m",
            Level::Warn => "\x1b[33m",
            Level::Error => "\x1b[31m",
        }
    }
}

/// Write one line to stderr: `LEVEL  message`, colored by level when stderr
/// is a TTY. Never panics on a broken pipe.
pub fn log(level: Level, message: impl AsRef<str>) {
    let line = if atty::is(atty::Stream::Stderr) {
        format!("{}{:<5}\x1b[0m  {}\n", level.color(), level.prefix(), message.as_ref())
    } else {
        format!("{:<5}  {}\n", level.prefix(), message.as_ref())
    };
    let _ = std::io::stderr().lock().write_all(line.as_bytes());
}

macro_rules! info {
    ($($arg:tt)*) => { $crate::log::log($crate::log::Level::Info, format!($($arg)*)) };
}

macro_rules! warn {
    ($($arg:tt)*) => { $crate::log::log($crate::log::Level::Warn, format!($($arg)*)) };
}

macro_rules! error {
    ($($arg:tt)*) => { $crate::log::log($crate::log::Level::Error, format!($($arg)*)) };
}

pub(crate) use error;
pub(crate) use info;
pub(crate) use warn;
