//! Telemetry sinks: how the engine reports what it did.
//!
//! Components never reach for a process-wide logger.  Each one that needs to
//! report something holds a [`SharedTelemetry`] handed to it at construction,
//! and uses the `log_info!` / `log_warn!` / `log_err!` macros with that sink as
//! the first argument:
//!
//! ```ignore
//! log_warn!(self.telemetry, "backend {} failed: {}", name, err);
//! ```
//!
//! Three sinks ship with the crate:
//! * [`LogTelemetry`] forwards to the `log` facade (the batch binary installs
//!   `env_logger` behind it).
//! * [`SessionLog`] writes to a single file that is **truncated at each
//!   launch**, so it only ever contains the most recent session.
//! * [`NullTelemetry`] discards everything (tests, embedding).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn tag(&self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Destination for engine diagnostics.
pub trait Telemetry: Send + Sync {
    fn record(&self, level: Level, message: &str);
}

pub type SharedTelemetry = Arc<dyn Telemetry>;

#[macro_export]
macro_rules! log_info {
    ($sink:expr, $($arg:tt)*) => {
        $sink.record($crate::logger::Level::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($sink:expr, $($arg:tt)*) => {
        $sink.record($crate::logger::Level::Warn, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_err {
    ($sink:expr, $($arg:tt)*) => {
        $sink.record($crate::logger::Level::Error, &format!($($arg)*))
    };
}

/// Forwards to the `log` crate.
#[derive(Default)]
pub struct LogTelemetry;

impl Telemetry for LogTelemetry {
    fn record(&self, level: Level, message: &str) {
        match level {
            Level::Info => log::info!(target: "paintcore", "{}", message),
            Level::Warn => log::warn!(target: "paintcore", "{}", message),
            Level::Error => log::error!(target: "paintcore", "{}", message),
        }
    }
}

#[derive(Default)]
pub struct NullTelemetry;

impl Telemetry for NullTelemetry {
    fn record(&self, _level: Level, _message: &str) {}
}

/// Convenience: a shared sink that drops everything.
pub fn null() -> SharedTelemetry {
    Arc::new(NullTelemetry)
}

/// Session log file.  Opening truncates any previous session's content.
pub struct SessionLog {
    file: Mutex<File>,
    path: PathBuf,
}

impl SessionLog {
    /// Create (or truncate) the log at `path` and write the session header.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let log = Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        };
        log.write_line(&format!("=== paintcore session started {} ===", human_timestamp()));
        log.write_line(&format!("Log file: {}", path.display()));
        log.write_line("");
        Ok(log)
    }

    /// Open the log at its default platform location.
    pub fn open_default() -> std::io::Result<Self> {
        Self::open(&default_log_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write failures are ignored so that logging never takes the engine down.
    fn write_line(&self, line: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}", line);
        }
    }
}

impl Telemetry for SessionLog {
    fn record(&self, level: Level, message: &str) {
        self.write_line(&format!("[{}] [{}] {}", timestamp(), level.tag(), message));
    }
}

/// `<data dir>/paintcore/paintcore.log`
pub fn default_log_path() -> PathBuf {
    data_dir().join("paintcore").join("paintcore.log")
}

/// Platform data directory (without the app sub-folder).
fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support");
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    PathBuf::from(".")
}

/// HH:MM:SS within the current UTC day.
fn timestamp() -> String {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => {
            let secs = d.as_secs();
            let h = (secs % 86400) / 3600;
            let m = (secs % 3600) / 60;
            let s = secs % 60;
            format!("{:02}:{:02}:{:02}", h, m, s)
        }
        Err(_) => "??:??:??".to_string(),
    }
}

fn human_timestamp() -> String {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => format!("(unix {})", d.as_secs()),
        Err(_) => "(unknown time)".to_string(),
    }
}
