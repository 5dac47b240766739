//! RecoveryLog: append-only line-delimited JSON event file used to warm the
//! registry on startup. A cache, not an authority — see the design notes on why
//! losing this file must never break correctness.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::worker::WorkerRecord;

const LOG_FILE_NAME: &str = "registry.jsonl";

#[derive(Debug, Error)]
pub enum RecoveryLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One replayable event. `register` carries the full record; `heartbeat` and
/// `deregister` carry just enough to mutate an already-loaded registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryLogEntry {
    Register {
        ts: DateTime<Utc>,
        worker: WorkerRecord,
    },
    Heartbeat {
        ts: DateTime<Utc>,
        worker_id: String,
    },
    Deregister {
        ts: DateTime<Utc>,
        worker_id: String,
    },
}

/// Append-only recovery log, single-writer (serialized by the registry lock).
pub struct RecoveryLog {
    path: PathBuf,
    file: File,
}

impl RecoveryLog {
    /// Open (creating if absent) the log file under `state_dir`.
    pub fn open(state_dir: &Path) -> Result<Self, RecoveryLogError> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    /// Append one entry. Best-effort durability: no fsync is required, since the
    /// log is a warm-cache optimization, not the source of truth.
    pub fn append(&mut self, entry: &RecoveryLogEntry) -> Result<(), RecoveryLogError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Replay every entry in file order. Malformed or schema-violating lines are
    /// skipped with a warning rather than aborting the whole replay.
    pub fn replay(state_dir: &Path) -> Result<Vec<RecoveryLogEntry>, RecoveryLogError> {
        let path = state_dir.join(LOG_FILE_NAME);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut entries = Vec::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!("recovery log: i/o error reading line {}: {}", line_no + 1, e);
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<RecoveryLogEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(
                        "recovery log: skipping malformed line {}: {}",
                        line_no + 1,
                        e
                    );
                }
            }
        }

        Ok(entries)
    }

    /// Atomically replace the log with a single `register` entry per currently-live
    /// worker (write to `.tmp`, then rename). Correctness never depends on this
    /// running; it is purely a compaction optimization.
    pub fn checkpoint(
        state_dir: &Path,
        workers: impl Iterator<Item = WorkerRecord>,
    ) -> Result<(), RecoveryLogError> {
        let tmp_path = state_dir.join(format!("{LOG_FILE_NAME}.tmp"));
        let final_path = state_dir.join(LOG_FILE_NAME);

        let mut tmp_file = File::create(&tmp_path)?;
        for worker in workers {
            let entry = RecoveryLogEntry::Register {
                ts: worker.registered_at,
                worker,
            };
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            tmp_file.write_all(line.as_bytes())?;
        }
        tmp_file.flush()?;

        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Path to the underlying file, for diagnostics/tests.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Any JSON value tolerated on replay must not abort the rest of the file: this
/// helper is used by tests to construct a deliberately-corrupt line.
#[cfg(test)]
fn raw_line(value: Value) -> String {
    value.to_string()
}
