//! Logging glue. Components hold a `Logger` and log through the
//! re-exported slog macros; `init` builds the process root logger.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::path::Path;

/// Error log verbosity, settable from the config file.
/// Info is the most verbose level used by the server itself.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    None,
}

impl LogLevel {
    fn severity(self) -> Severity {
        match self {
            LogLevel::Info => Severity::Debug,
            LogLevel::Warning => Severity::Warning,
            LogLevel::Error => Severity::Error,
            LogLevel::None => Severity::Critical,
        }
    }
}

/// Build the root logger. With a path the log goes to a file
/// (reopened externally via SIGHUP/SIGUSR1 by restarting the server
/// logger); without one it goes to stderr.
pub fn init(error_log: Option<&Path>, level: LogLevel) -> Logger {
    match error_log {
        Some(path) => {
            let mut builder = FileLoggerBuilder::new(path);
            builder.level(level.severity());
            builder
                .build()
                .expect("Error opening error log file")
        }
        None => {
            let mut builder = TerminalLoggerBuilder::new();
            builder.level(level.severity());
            builder.destination(Destination::Stderr);
            builder.build().expect("Error building terminal logger")
        }
    }
}

/// Logger that discards everything. Used by tests and detached
/// components.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
