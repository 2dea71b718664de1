#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON logging shared by the overwatcher components.
//!
//! Every record is a single JSON object per line. [`NightlyJsonLogger`] keys the
//! output file on the observing-night identifier so each night gets its own log.

use std::{
    fmt,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log severity level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational events.
    Info,
    /// Warning indicator.
    Warn,
    /// Error indicator.
    Error,
    /// Condition that needs an operator right now.
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// One line of a JSON log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// When the record was created.
    pub timestamp: DateTime<Utc>,
    /// Component emitting the log.
    pub module: String,
    /// Severity.
    pub level: LogLevel,
    /// Dotted event name or free text.
    pub message: String,
    /// Observing night the record belongs to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub night: Option<i64>,
    /// Structured fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Record stamped with the current time.
    #[must_use]
    pub fn new(module: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            module: module.into(),
            level,
            message: message.into(),
            night: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Tags the record with an observing night.
    #[must_use]
    pub const fn with_night(mut self, night: i64) -> Self {
        self.night = Some(night);
        self
    }

    /// Adds a metadata field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Append-only JSON-lines file shared between threads.
#[derive(Debug)]
pub struct JsonLogger {
    path: PathBuf,
    writer: Mutex<File>,
}

impl JsonLogger {
    /// Opens `path` for appending, creating it and its parent directories.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_append(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Appends `record`.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        write_line(&mut self.writer.lock(), record)
    }

    /// Location of the log.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// JSON logger that starts a new file whenever the observing night changes.
#[derive(Debug)]
pub struct NightlyJsonLogger {
    dir: PathBuf,
    prefix: String,
    current: Mutex<Option<(i64, File)>>,
}

impl NightlyJsonLogger {
    /// Creates a logger writing `<dir>/<prefix>-<night>.log.jsonl` files.
    pub fn new(dir: impl AsRef<Path>, prefix: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
            current: Mutex::new(None),
        })
    }

    /// Path of the file used for a given night.
    #[must_use]
    pub fn path_for(&self, night: i64) -> PathBuf {
        self.dir.join(format!("{}-{night}.log.jsonl", self.prefix))
    }

    /// Writes a record into the file of `night`, rotating if the night changed.
    pub fn log(&self, night: i64, record: &LogRecord) -> Result<()> {
        let mut current = self.current.lock();
        let rotate = current.as_ref().map_or(true, |(open, _)| *open != night);
        if rotate {
            let file = open_append(&self.path_for(night))?;
            *current = Some((night, file));
        }
        match current.as_mut() {
            Some((_, file)) => write_line(file, record),
            None => Ok(()),
        }
    }

    /// Night of the file currently open, if any.
    #[must_use]
    pub fn current_night(&self) -> Option<i64> {
        self.current.lock().as_ref().map(|(night, _)| *night)
    }
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log {}", path.display()))
}

/// Writes the record and its newline in one call so concurrent writers never
/// interleave within a line.
fn write_line(file: &mut File, record: &LogRecord) -> Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    file.write_all(&line)?;
    file.flush()?;
    Ok(())
}
