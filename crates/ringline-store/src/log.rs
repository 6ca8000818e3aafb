//! Append-only persistence of call records.
//!
//! Each change writes the full record as one JSON line. Loading replays the
//! file and keeps the last line seen for each call ID.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ringline_types::CallRecord;

use crate::error::StoreError;

/// A sink for call record snapshots.
pub trait CallPersistence: Send + Sync {
    /// Records the current state of one call.
    fn append(&self, record: &CallRecord) -> Result<(), StoreError>;

    /// Returns the latest snapshot of every call ever appended.
    fn load(&self) -> Result<Vec<CallRecord>, StoreError>;
}

/// JSON-lines call log.
#[derive(Debug)]
pub struct JsonlCallLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlCallLog {
    /// Opens (or creates) the log at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CallPersistence for JsonlCallLog {
    fn append(&self, record: &CallRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("call log mutex poisoned, recovering");
                poisoned.into_inner()
            }
        };
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<CallRecord>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, CallRecord> = HashMap::new();

        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: CallRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = lineno + 1,
                        error = %e,
                        "skipping corrupt call log line"
                    );
                    continue;
                }
            };
            if !latest.contains_key(&record.call_id) {
                order.push(record.call_id.clone());
            }
            latest.insert(record.call_id.clone(), record);
        }

        Ok(order
            .into_iter()
            .filter_map(|id| latest.remove(&id))
            .collect())
    }
}
