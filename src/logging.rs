//! Structured logging for the monitoring service.
//!
//! Provides context-rich logging with subsystem tags, optional station
//! identifiers, timestamps, and severity levels. Supports both console
//! output and file-based logging for daemon operations.

use chrono::Utc;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

// ---------------------------------------------------------------------------
// Subsystem tags
// ---------------------------------------------------------------------------

/// Which part of the service emitted a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Engine,
    Features,
    Neighbors,
    Model,
    Rules,
    Store,
    Stations,
    Daemon,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subsystem::Engine => write!(f, "ENGINE"),
            Subsystem::Features => write!(f, "FEAT"),
            Subsystem::Neighbors => write!(f, "NBR"),
            Subsystem::Model => write!(f, "MODEL"),
            Subsystem::Rules => write!(f, "RULES"),
            Subsystem::Store => write!(f, "STORE"),
            Subsystem::Stations => write!(f, "STIDX"),
            Subsystem::Daemon => write!(f, "DAEMON"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

/// Global logger instance. Uninitialized logging is a no-op, so library
/// consumers and unit tests need no setup.
static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);

pub struct Logger {
    /// Minimum log level to emit.
    min_level: LogLevel,
    /// Optional file path for append-mode logging.
    log_file: Option<String>,
}

impl Logger {
    /// Initialize the global logger. Later calls replace the earlier config.
    pub fn init(min_level: LogLevel, log_file: Option<String>) {
        *LOGGER.lock().unwrap() = Some(Logger { min_level, log_file });
    }

    fn log(&self, level: LogLevel, subsystem: Subsystem, station: Option<&str>, message: &str) {
        if level < self.min_level {
            return;
        }

        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let station_part = station.map(|s| format!(" [{}]", s)).unwrap_or_default();
        let entry = format!("{} {} {}{}: {}", timestamp, level, subsystem, station_part, message);

        match level {
            LogLevel::Error | LogLevel::Warning => eprintln!("{}", entry),
            _ => println!("{}", entry),
        }

        if let Some(ref path) = self.log_file {
            if let Err(e) = Self::append_to_file(path, &entry) {
                eprintln!("Failed to write to log file {}: {}", path, e);
            }
        }
    }

    fn append_to_file(path: &str, entry: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", entry)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Public logging functions
// ---------------------------------------------------------------------------

/// Initialize the global logger.
pub fn init_logger(min_level: LogLevel, log_file: Option<&str>) {
    Logger::init(min_level, log_file.map(String::from));
}

pub fn debug(subsystem: Subsystem, station: Option<&str>, message: &str) {
    if let Some(logger) = LOGGER.lock().unwrap().as_ref() {
        logger.log(LogLevel::Debug, subsystem, station, message);
    }
}

pub fn info(subsystem: Subsystem, station: Option<&str>, message: &str) {
    if let Some(logger) = LOGGER.lock().unwrap().as_ref() {
        logger.log(LogLevel::Info, subsystem, station, message);
    }
}

pub fn warn(subsystem: Subsystem, station: Option<&str>, message: &str) {
    if let Some(logger) = LOGGER.lock().unwrap().as_ref() {
        logger.log(LogLevel::Warning, subsystem, station, message);
    }
}

pub fn error(subsystem: Subsystem, station: Option<&str>, message: &str) {
    if let Some(logger) = LOGGER.lock().unwrap().as_ref() {
        logger.log(LogLevel::Error, subsystem, station, message);
    }
}

/// Log a per-station skip with the stage it failed at. Skips are expected
/// operational events, so they log at Warning rather than Error.
pub fn log_station_skip(station: &str, metric: &str, stage: &str, cause: &dyn std::error::Error) {
    warn(
        Subsystem::Engine,
        Some(station),
        &format!("skipped metric {} at stage {}: {}", metric, stage, cause),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }

    #[test]
    fn test_logging_without_init_is_a_noop() {
        // Must not panic even though no logger has been installed.
        debug(Subsystem::Engine, None, "uninitialized debug");
        error(Subsystem::Store, Some("S1"), "uninitialized error");
    }
}
