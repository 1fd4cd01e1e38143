//! Crash-safe per-row checkpoint log.
//!
//! The on-disk format is JSON lines, one [`CheckpointRecord`] per line, appended
//! and fsynced on every `put`. Replay keeps the latest record per row. A crash
//! mid-append can only leave a final line without its terminating newline; that
//! torn tail is dropped and truncated away on open.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cif_core::{CheckpointRecord, RowId, RowStatus};
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt checkpoint line {line} in {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("row {row_id} is already {from:?}; refusing transition to {to:?}")]
    TerminalTransition {
        row_id: RowId,
        from: RowStatus,
        to: RowStatus,
    },
    #[error("serializing checkpoint record: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CheckpointError {
    fn io(path: &Path, source: io::Error) -> Self {
        CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointSummary {
    pub pending: usize,
    pub done: usize,
    pub failed: usize,
}

impl CheckpointSummary {
    pub fn terminal(&self) -> usize {
        self.done + self.failed
    }
}

pub trait CheckpointStore: Send {
    fn get(&self, row_id: &RowId) -> Option<CheckpointRecord>;

    /// Durably record a row's state. Must be atomic with respect to interruption.
    fn put(&mut self, record: CheckpointRecord) -> Result<(), CheckpointError>;

    fn load_all(&self) -> BTreeMap<RowId, CheckpointRecord>;

    fn summary(&self) -> CheckpointSummary {
        let mut summary = CheckpointSummary::default();
        for record in self.load_all().values() {
            match record.status {
                RowStatus::Pending => summary.pending += 1,
                RowStatus::Done => summary.done += 1,
                RowStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

fn check_transition(
    existing: Option<&CheckpointRecord>,
    next: &CheckpointRecord,
) -> Result<(), CheckpointError> {
    match existing {
        Some(current) if !current.status.can_transition_to(next.status) => {
            Err(CheckpointError::TerminalTransition {
                row_id: next.row_id.clone(),
                from: current.status,
                to: next.status,
            })
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: BTreeMap<RowId, CheckpointRecord>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, row_id: &RowId) -> Option<CheckpointRecord> {
        self.records.get(row_id).cloned()
    }

    fn put(&mut self, record: CheckpointRecord) -> Result<(), CheckpointError> {
        check_transition(self.records.get(&record.row_id), &record)?;
        self.records.insert(record.row_id.clone(), record);
        Ok(())
    }

    fn load_all(&self) -> BTreeMap<RowId, CheckpointRecord> {
        self.records.clone()
    }
}

#[derive(Debug)]
pub struct JsonlCheckpointStore {
    path: PathBuf,
    file: File,
    records: BTreeMap<RowId, CheckpointRecord>,
}

impl JsonlCheckpointStore {
    /// Open (creating if needed) and replay the log at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;
        }

        let (records, valid_len) = match fs::read(&path) {
            Ok(bytes) => replay(&path, &bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => (BTreeMap::new(), 0),
            Err(err) => return Err(CheckpointError::io(&path, err)),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CheckpointError::io(&path, e))?;
        let on_disk = file
            .metadata()
            .map_err(|e| CheckpointError::io(&path, e))?
            .len();
        if on_disk > valid_len {
            warn!(
                path = %path.display(),
                dropped_bytes = on_disk - valid_len,
                "truncating torn checkpoint tail"
            );
            file.set_len(valid_len)
                .and_then(|_| file.sync_all())
                .map_err(|e| CheckpointError::io(&path, e))?;
        }

        Ok(Self {
            path,
            file,
            records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the log with one line per row via write-temp-then-rename.
    pub fn compact(&mut self) -> Result<(), CheckpointError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir).map_err(|e| CheckpointError::io(dir, e))?;
        for record in self.records.values() {
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');
            temp.write_all(&line)
                .map_err(|e| CheckpointError::io(temp.path(), e))?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|e| CheckpointError::io(temp.path(), e))?;
        temp.persist(&self.path)
            .map_err(|e| CheckpointError::io(&self.path, e.error))?;

        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| CheckpointError::io(&self.path, e))?;
        Ok(())
    }
}

/// Returns the replayed records and the byte length of the intact prefix.
fn replay(
    path: &Path,
    bytes: &[u8],
) -> Result<(BTreeMap<RowId, CheckpointRecord>, u64), CheckpointError> {
    let mut records: BTreeMap<RowId, CheckpointRecord> = BTreeMap::new();
    let mut offset = 0usize;
    let mut line_no = 0usize;

    while offset < bytes.len() {
        let Some(newline) = bytes[offset..].iter().position(|b| *b == b'\n') else {
            // no terminating newline: torn final append
            break;
        };
        line_no += 1;
        let line = &bytes[offset..offset + newline];
        offset += newline + 1;

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let record: CheckpointRecord =
            serde_json::from_slice(line).map_err(|source| CheckpointError::Corrupt {
                path: path.to_path_buf(),
                line: line_no,
                source,
            })?;
        if let Err(err) = check_transition(records.get(&record.row_id), &record) {
            warn!(line = line_no, error = %err, "ignoring out-of-order checkpoint line");
            continue;
        }
        records.insert(record.row_id.clone(), record);
    }

    Ok((records, offset as u64))
}

impl CheckpointStore for JsonlCheckpointStore {
    fn get(&self, row_id: &RowId) -> Option<CheckpointRecord> {
        self.records.get(row_id).cloned()
    }

    fn put(&mut self, record: CheckpointRecord) -> Result<(), CheckpointError> {
        check_transition(self.records.get(&record.row_id), &record)?;

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|_| self.file.sync_data())
            .map_err(|e| CheckpointError::io(&self.path, e))?;

        self.records.insert(record.row_id.clone(), record);
        Ok(())
    }

    fn load_all(&self) -> BTreeMap<RowId, CheckpointRecord> {
        self.records.clone()
    }
}
