//! Human-readable run progress.
//!
//! The orchestrator reports every stage through a [`ProgressSink`] in addition
//! to `tracing`. The CLI writes those lines to a dated log file, which is later
//! stored inside the archive, and echoes them on stdout in interactive mode.

use std::{
    fmt::{Display, Formatter},
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{Local, NaiveDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        };
        write!(f, "{name}")
    }
}

/// `[YYYY-MM-DD HH:MM:SS] LEVEL: message`
pub fn format_line(timestamp: NaiveDateTime, level: Level, message: &str) -> String {
    format!("[{}] {level}: {message}", timestamp.format("%Y-%m-%d %H:%M:%S"))
}

pub trait ProgressSink: Send {
    fn line(&mut self, level: Level, message: &str);

    /// Make everything written so far durable, e.g. before the log is archived.
    fn flush(&mut self) {}
}

/// Discards every line.
#[derive(Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn line(&mut self, _level: Level, _message: &str) {}
}

/// Prints timestamped lines on stdout.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn line(&mut self, level: Level, message: &str) {
        println!("{}", format_line(Local::now().naive_local(), level, message));
    }
}

/// Appends timestamped lines to a log file.
#[derive(Debug)]
pub struct LogFileSink {
    path: PathBuf,
    file: File,
}

impl LogFileSink {
    /// Open `path` for appending, creating its directory first.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProgressSink for LogFileSink {
    fn line(&mut self, level: Level, message: &str) {
        let entry = format_line(Local::now().naive_local(), level, message);
        if let Err(e) = writeln!(self.file, "{entry}") {
            // the run goes on, tracing still has the line
            tracing::warn!("Failed to write log file {}: {e}", self.path.display());
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.file.sync_all() {
            tracing::warn!("Failed to sync log file {}: {e}", self.path.display());
        }
    }
}

/// Fans every line out to several sinks.
#[derive(Default)]
pub struct TeeSink {
    sinks: Vec<Box<dyn ProgressSink>>,
}

impl TeeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl ProgressSink for TeeSink {
    fn line(&mut self, level: Level, message: &str) {
        for sink in &mut self.sinks {
            sink.line(level, message);
        }
    }

    fn flush(&mut self) {
        for sink in &mut self.sinks {
            sink.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::NaiveDate;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_format_line() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        assert_eq!(
            format_line(ts, Level::Warning, "detach failed"),
            "[2024-01-01 03:04:05] WARNING: detach failed"
        );
    }

    #[test]
    fn test_log_file_sink_appends() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("logs/backup_2024_01_01.log");

        let mut sink = LogFileSink::open(&path).unwrap();
        sink.line(Level::Info, "first");
        sink.flush();
        drop(sink);

        let mut sink = TeeSink::new().with(LogFileSink::open(&path).unwrap()).with(NullSink);
        sink.line(Level::Fatal, "second");
        sink.flush();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('[') && lines[0].ends_with("] INFO: first"));
        assert!(lines[1].ends_with("] FATAL: second"));
    }
}
