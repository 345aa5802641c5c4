use chrono::{Local, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

pub const SESSION_LOG_FILE: &str = "~backup_log~.log";

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub level: String,
    pub message: String,
    pub directory: Option<String>,
}

/// Append-only human readable log of one backup session, with a bounded
/// in-memory tail for observers.
#[derive(Clone)]
pub struct SessionLog {
    buffer: Arc<Mutex<VecDeque<LogEntry>>>,
    max_entries: usize,
    file: Arc<Mutex<BufWriter<File>>>,
    path: PathBuf,
}

impl SessionLog {
    /// Opens (or appends to) the session log inside `folder`.
    pub fn create(folder: &Path, max_entries: usize) -> io::Result<Self> {
        let path = folder.join(SESSION_LOG_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(max_entries))),
            max_entries,
            file: Arc::new(Mutex::new(BufWriter::new(file))),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, message: impl Into<String>) {
        self.add_log("info", message.into(), None);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.add_log("error", message.into(), None);
    }

    pub fn add_log(&self, level: &str, message: String, directory: Option<String>) {
        let mut line = format!(
            "{} [{}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            level,
            message
        );
        if let Some(dir) = &directory {
            line.push_str(&format!(" ({})", dir));
        }
        if let Err(e) = writeln!(self.file.lock(), "{}", line) {
            warn!("Failed to write session log: {}", e);
        }

        let entry = LogEntry {
            timestamp: Utc::now().timestamp(),
            level: level.to_string(),
            message,
            directory,
        };
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.max_entries {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }

    pub fn get_logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        let buffer = self.buffer.lock();
        let skip = match limit {
            Some(n) => buffer.len().saturating_sub(n),
            None => 0,
        };
        buffer.iter().skip(skip).cloned().collect()
    }

    pub fn flush(&self) -> io::Result<()> {
        self.file.lock().flush()
    }
}
