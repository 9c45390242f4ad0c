use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use donation_core::{DonationRecord, FIELD_NAMES};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::config::BackupConfig;

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("backup sink i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("backup sink encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which sinks accepted the last append.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct MirrorOutcome {
    pub csv_written: bool,
    pub json_written: bool,
}

/// Best-effort duplicate of every accepted record in two files: an
/// append-only CSV log and a bounded pretty-printed JSON array.
///
/// Each sink has its own lock, so one slow sink does not stall the other and
/// two appenders never interleave within a sink.
#[derive(Debug)]
pub struct BackupMirror {
    csv_path: PathBuf,
    json_path: PathBuf,
    retention: usize,
    csv_lock: Mutex<()>,
    json_lock: Mutex<()>,
}

impl BackupMirror {
    #[must_use]
    pub fn new(config: &BackupConfig) -> Self {
        Self {
            csv_path: config.csv_path.clone(),
            json_path: config.json_path.clone(),
            retention: config.retention,
            csv_lock: Mutex::new(()),
            json_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    #[must_use]
    pub fn json_path(&self) -> &Path {
        &self.json_path
    }

    /// Write `record` to both sinks. Failures are logged and reported in the
    /// outcome, never returned.
    pub fn append(&self, record: &DonationRecord) -> MirrorOutcome {
        let csv_written = match self.append_csv(record) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(path = %self.csv_path.display(), error = %err, "csv backup append failed");
                false
            }
        };
        let json_written = match self.append_json(record) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(path = %self.json_path.display(), error = %err, "json backup append failed");
                false
            }
        };
        MirrorOutcome { csv_written, json_written }
    }

    /// Append one CSV row, preceded by the header row when the file is empty.
    ///
    /// # Errors
    /// Returns [`MirrorError::Io`] when the file cannot be created or written.
    pub fn append_csv(&self, record: &DonationRecord) -> Result<(), MirrorError> {
        let _guard = self.csv_lock.lock().unwrap_or_else(PoisonError::into_inner);
        ensure_parent_dir(&self.csv_path)?;

        let mut file = OpenOptions::new().create(true).append(true).open(&self.csv_path)?;
        let mut chunk = String::new();
        if file.metadata()?.len() == 0 {
            chunk.push_str(&csv_row(&FIELD_NAMES));
        }
        chunk.push_str(&csv_row(&record.fields()));
        file.write_all(chunk.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Add `record` to the JSON array, drop the oldest entries beyond the
    /// retention bound, and atomically replace the file.
    ///
    /// # Errors
    /// Returns [`MirrorError`] when encoding or the replacement write fails.
    pub fn append_json(&self, record: &DonationRecord) -> Result<(), MirrorError> {
        let _guard = self.json_lock.lock().unwrap_or_else(PoisonError::into_inner);
        ensure_parent_dir(&self.json_path)?;

        let mut entries = self.read_entries_lenient();
        entries.push(serde_json::to_value(record)?);
        if entries.len() > self.retention {
            let excess = entries.len() - self.retention;
            entries.drain(..excess);
        }

        write_atomically(&self.json_path, &encode_pretty(&entries)?)
    }

    /// Records currently retained in the JSON sink, oldest first. A missing
    /// file reads as empty; entries that are not objects are skipped.
    ///
    /// # Errors
    /// Returns [`MirrorError`] when the file exists but cannot be read or parsed.
    pub fn read_structured(&self) -> Result<Vec<DonationRecord>, MirrorError> {
        let _guard = self.json_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let text = match fs::read_to_string(&self.json_path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let entries: Vec<Value> = serde_json::from_str(&text)?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<DonationRecord>(entry) {
                Ok(record) => Some(record),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping malformed json backup entry");
                    None
                }
            })
            .collect())
    }

    // Existing entries are kept as raw values so fields this process does not
    // know about survive the rewrite.
    fn read_entries_lenient(&self) -> Vec<Value> {
        let text = match fs::read_to_string(&self.json_path) {
            Ok(text) => text,
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    tracing::warn!(path = %self.json_path.display(), error = %err, "json backup unreadable; starting a new array");
                }
                return Vec::new();
            }
        };
        if text.trim().is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<Vec<Value>>(&text) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(path = %self.json_path.display(), error = %err, "json backup unparseable; starting a new array");
                Vec::new()
            }
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), MirrorError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), MirrorError> {
    let parent = match path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        Some(parent) => parent.to_path_buf(),
        None => PathBuf::from("."),
    };

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| MirrorError::Io(err.error))?;
    Ok(())
}

fn encode_pretty(entries: &[Value]) -> Result<Vec<u8>, MirrorError> {
    let mut out = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    entries.serialize(&mut serializer)?;
    out.push(b'\n');
    Ok(out)
}

fn csv_row(fields: &[&str]) -> String {
    let mut row = fields.iter().map(|field| csv_escape(field)).collect::<Vec<_>>().join(",");
    row.push('\n');
    row
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\\', ' ', '\t', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
