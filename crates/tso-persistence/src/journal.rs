//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persisted registry and ledger for tenant service state."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Append-only JSONL audit trail of completed transitions.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::metrics::PersistenceMetrics;
use crate::store::STATE_FORMAT_VERSION;
use crate::{PersistenceError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalHeader {
    version: u16,
    created_at: DateTime<Utc>,
}

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Sequential identifier assigned when appending.
    pub sequence: u64,
    /// Timestamp when the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Event kind, e.g. `service_activated`.
    pub kind: String,
    /// Event details.
    pub payload: serde_json::Value,
}

impl JournalEntry {
    /// Construct an entry; the sequence is assigned on append.
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            kind: kind.into(),
            payload,
        }
    }
}

/// Append-only writer for the journal file.
pub struct JournalWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
}

impl JournalWriter {
    /// Open a journal for appending, writing a header if the file is new.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let fresh = !path.exists() || fs::metadata(path)?.len() == 0;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);

        let next_sequence = if fresh {
            let header = JournalHeader {
                version: STATE_FORMAT_VERSION,
                created_at: Utc::now(),
            };
            writer.write_all(serde_json::to_string(&header)?.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            0
        } else {
            last_sequence(path)?
        };

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            next_sequence,
        })
    }

    /// Append an entry; returns the assigned sequence number and byte count.
    pub fn append(&mut self, mut entry: JournalEntry) -> Result<(u64, usize)> {
        self.next_sequence += 1;
        entry.sequence = self.next_sequence;
        let line = serde_json::to_string(&entry)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok((entry.sequence, line.len() + 1))
    }

    /// Path on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn last_sequence(path: &Path) -> Result<u64> {
    let reader = BufReader::new(File::open(path)?);
    let mut last = 0u64;
    for line in reader.lines().skip(1) {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<JournalEntry>(&line) {
            last = entry.sequence;
        }
    }
    Ok(last)
}

/// Sequential reader over journal entries.
pub struct JournalReader {
    lines: std::io::Lines<BufReader<File>>,
}

impl JournalReader {
    /// Open the journal, skipping its header.
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut header = String::new();
        reader.read_line(&mut header)?;
        Ok(Self {
            lines: reader.lines(),
        })
    }
}

impl Iterator for JournalReader {
    type Item = Result<JournalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => return Some(serde_json::from_str(&line).map_err(PersistenceError::from)),
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}

/// Shared journal handle; a disabled journal swallows entries.
pub struct Journal {
    writer: Option<Mutex<JournalWriter>>,
    metrics: Option<PersistenceMetrics>,
}

impl Journal {
    /// Journal backed by `path`.
    pub fn open(path: &Path, metrics: Option<PersistenceMetrics>) -> Result<Self> {
        Ok(Self {
            writer: Some(Mutex::new(JournalWriter::open(path)?)),
            metrics,
        })
    }

    /// Journal that records nothing.
    pub fn disabled() -> Self {
        Self {
            writer: None,
            metrics: None,
        }
    }

    /// Append an event. Write failures are logged, never propagated: the
    /// journal is an audit aid, the state store is the source of truth.
    pub fn record(&self, kind: &str, payload: serde_json::Value) {
        let Some(writer) = &self.writer else { return };
        let mut writer = writer.lock();
        match writer.append(JournalEntry::new(kind, payload)) {
            Ok((_, bytes)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_journal_bytes(bytes);
                }
            }
            Err(err) => warn!(
                journal = %writer.path().display(),
                kind,
                error = %err,
                "failed to append journal entry"
            ),
        }
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("enabled", &self.writer.is_some())
            .finish()
    }
}
