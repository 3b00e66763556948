//! Structured logging for debugging hive.
//!
//! Log levels:
//! - ERROR: Failures that stop an operation, such as a dispatch that could not be sent
//! - WARN: Recoverable surprises like stale replies or failed snapshots
//! - INFO: Lifecycle events (runtimes starting and stopping, runs finishing)
//! - DEBUG: Per-operation traces
//! - TRACE: Everything else
//!
//! Library code only emits `tracing` events; the binary calls
//! [`init_with_debug`] once to install a subscriber writing to
//! `~/.hive/hive.log`. Debug mode can be enabled with the `--debug` flag or
//! `HIVE_DEBUG=1`, and `HIVE_LOG` overrides the filter entirely.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Environment variable that turns debug mode on.
pub const DEBUG_ENV: &str = "HIVE_DEBUG";
/// Environment variable holding a full filter directive.
pub const FILTER_ENV: &str = "HIVE_LOG";

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    /// Filter directive: this crate at the level, dependencies at warn.
    pub fn directive(&self) -> String {
        format!("warn,hive={}", self.as_str().to_ascii_lowercase())
    }
}

/// Path of the log file, `~/.hive/hive.log`.
pub fn log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".hive").join("hive.log"))
}

/// Initialize logging at INFO.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_flag(std::env::var(DEBUG_ENV).ok().as_deref());
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let level = if debug_enabled {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let filter = EnvFilter::try_from_env(FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(level.directive()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false);

    // Truncated on startup; falls back to stderr when there is no home.
    let file = log_path().and_then(|path| {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).ok()?;
        }
        File::create(&path).ok()
    });

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = match file {
        Some(file) => builder.with_writer(Mutex::new(file)).try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn env_flag(value: Option<&str>) -> bool {
    value
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
