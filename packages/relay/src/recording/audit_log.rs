// packages/relay/src/recording/audit_log.rs
//! Append-only local audit log
//!
//! One JSON object per line, written on every recorded event regardless of
//! whether delivery is configured. Never compacted, never pruned.

use crate::recording::event::Event;
use crate::utils::errors::Result;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Best-effort JSON-lines audit trail
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl AuditLog {
    /// Create a log at `path`; the file is opened lazily on first append
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line. Errors are logged, never returned.
    pub fn append(&self, event: &Event) {
        if let Err(e) = self.try_append(event) {
            warn!(path = %self.path.display(), error = %e, "Audit log append failed");
        }
    }

    fn try_append(&self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut guard = self.file.lock();
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            *guard = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        }

        let result = match guard.as_mut() {
            Some(file) => file.write_all(&line),
            None => Ok(()),
        };

        if let Err(e) = result {
            // Reopen on the next append (the file may have been rotated away)
            *guard = None;
            return Err(e.into());
        }

        Ok(())
    }

    /// Read up to the last `limit` entries, oldest first; malformed lines are skipped
    pub fn read_recent(&self, limit: usize) -> Result<Vec<Event>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = std::collections::VecDeque::with_capacity(limit);
        for line in BufReader::new(file).lines() {
            let line = line?;
            if let Ok(event) = serde_json::from_str::<Event>(&line) {
                if events.len() == limit {
                    events.pop_front();
                }
                events.push_back(event);
            }
        }

        Ok(events.into())
    }
}
