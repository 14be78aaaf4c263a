// packages/relay/src/recording/store.rs
//! Durable event store
//!
//! Every event is persisted as its own file in the queue directory, so a
//! torn write can only ever damage the record being written. Names embed a
//! monotonic ULID (`evt-<ulid>.json`): lexical order is creation order
//! within a process and names never collide across processes.
//!
//! Records are written to a `.tmp` sibling and renamed into place, so
//! readers never observe a half-written record under its final name.

use crate::compaction::trigger::CompactionTrigger;
use crate::recording::event::{Event, QueueRecord, RecordHandle};
use crate::utils::errors::Result;
use parking_lot::Mutex;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use ulid::Ulid;

/// Queue record file prefix
pub const RECORD_PREFIX: &str = "evt-";

/// Queue record file suffix
pub const RECORD_SUFFIX: &str = ".json";

/// Suffix appended to records that failed to parse
pub const CORRUPT_SUFFIX: &str = ".corrupt";

/// Suffix of a record or archive still being written
pub const TMP_SUFFIX: &str = ".tmp";

/// Size and location of one queue record, without parsing it
#[derive(Debug, Clone)]
pub struct RecordFile {
    pub handle: RecordHandle,
    pub size_bytes: u64,
}

/// Per-record durable store
pub struct EventStore {
    dir: PathBuf,
    /// Last id handed out; ids only ever increase
    last_id: Mutex<Ulid>,
    compaction_trigger: Option<CompactionTrigger>,
}

impl EventStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        debug!(dir = %dir.display(), "Event store opened");

        Ok(Self {
            dir,
            last_id: Mutex::new(Ulid::nil()),
            compaction_trigger: None,
        })
    }

    /// Signal `trigger` after every successful append
    pub fn with_compaction_trigger(mut self, trigger: CompactionTrigger) -> Self {
        self.compaction_trigger = Some(trigger);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist one event. Never fails: I/O errors are logged and yield `None`.
    pub fn append(&self, event: &Event) -> Option<RecordHandle> {
        match self.try_append(event) {
            Ok(handle) => {
                if let Some(trigger) = &self.compaction_trigger {
                    trigger.request();
                }
                Some(handle)
            }
            Err(e) => {
                warn!(
                    dir = %self.dir.display(),
                    provider = %event.provider,
                    error = %e,
                    "Failed to persist event; continuing without a durable handle"
                );
                None
            }
        }
    }

    fn try_append(&self, event: &Event) -> Result<RecordHandle> {
        let id = self.next_id();
        let name = format!("{}{}{}", RECORD_PREFIX, id, RECORD_SUFFIX);
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!("{}{}", name, TMP_SUFFIX));

        let bytes = serde_json::to_vec(event)?;
        fs::write(&tmp, &bytes)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        Ok(RecordHandle::new(path))
    }

    fn next_id(&self) -> Ulid {
        let mut last = self.last_id.lock();
        *last = Ulid::new().max(successor(*last));
        *last
    }

    /// Enumerate record files oldest first without reading them
    pub fn scan(&self) -> Result<Vec<RecordFile>> {
        let mut files = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if !is_record_name(&name.to_string_lossy()) {
                continue;
            }

            let size_bytes = match entry.metadata() {
                Ok(metadata) => metadata.len(),
                // Deleted by a concurrent delivery or compaction
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            files.push(RecordFile {
                handle: RecordHandle::new(entry.path()),
                size_bytes,
            });
        }

        files.sort_by(|a, b| a.handle.cmp(&b.handle));
        Ok(files)
    }

    /// Load every readable record oldest first; unreadable ones are skipped
    pub fn list_all(&self) -> Result<Vec<QueueRecord>> {
        Self::load(self.scan()?)
    }

    /// A handle ordering after every record written up to the current
    /// millisecond, by any process, and before every record this store
    /// writes later. Nothing is written for it.
    pub fn checkpoint(&self) -> RecordHandle {
        let mut last = self.last_id.lock();
        let end_of_now = Ulid::from_parts(Ulid::new().timestamp_ms(), MAX_RANDOM);
        *last = end_of_now.max(*last);

        let name = format!("{}{}{}", RECORD_PREFIX, *last, RECORD_SUFFIX);
        RecordHandle::new(self.dir.join(name))
    }

    /// Like [`list_all`](Self::list_all), limited to records older than `checkpoint`
    pub fn list_before(&self, checkpoint: &RecordHandle) -> Result<Vec<QueueRecord>> {
        let mut files = self.scan()?;
        files.retain(|file| file.handle < *checkpoint);
        Self::load(files)
    }

    fn load(files: Vec<RecordFile>) -> Result<Vec<QueueRecord>> {
        let mut records = Vec::new();

        for file in files {
            match read_record(file.handle.path()) {
                Ok(Some(event)) => records.push(QueueRecord::new(event, Some(file.handle))),
                Ok(None) => {}
                Err(e) => warn!(
                    path = %file.handle,
                    error = %e,
                    "Skipping unreadable queue record"
                ),
            }
        }

        Ok(records)
    }

    /// Delete a record. Deleting an already-deleted record is not an error.
    ///
    /// Returns whether this call removed the file.
    pub fn remove(&self, handle: &RecordHandle) -> Result<bool> {
        remove_record(handle)
    }
}

const MAX_RANDOM: u128 = (1 << 80) - 1;

fn successor(id: Ulid) -> Ulid {
    id.increment()
        .unwrap_or_else(|| Ulid::from_parts(id.timestamp_ms() + 1, 0))
}

/// Whether `name` is a live queue record (not tmp, corrupt, archive, or lock)
pub fn is_record_name(name: &str) -> bool {
    name.starts_with(RECORD_PREFIX) && name.ends_with(RECORD_SUFFIX)
}

/// Read one record; `Ok(None)` when it vanished before it could be read
pub fn read_record(path: &Path) -> Result<Option<Event>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Idempotent record deletion shared by delivery and compaction
pub fn remove_record(handle: &RecordHandle) -> Result<bool> {
    match fs::remove_file(handle.path()) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::trigger::compaction_channel;
    use tempfile::tempdir;

    fn event(n: usize) -> Event {
        Event {
            timestamp: format!("2026-01-01T00:00:{:02}.000Z", n % 60),
            provider: "polygon".to_string(),
            message: format!("rate limited #{}", n),
        }
    }

    #[test]
    fn test_append_and_list_in_order() {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path()).unwrap();

        for n in 0..20 {
            assert!(store.append(&event(n)).is_some());
        }

        let records = store.list_all().unwrap();
        assert_eq!(records.len(), 20);
        for (n, record) in records.iter().enumerate() {
            assert_eq!(record.event, event(n));
            assert!(record.handle.as_ref().unwrap().path().exists());
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path()).unwrap();

        let first = store.append(&event(1)).unwrap();
        let second = store.append(&event(2)).unwrap();

        assert!(store.remove(&first).unwrap());
        assert!(!store.remove(&first).unwrap());

        let remaining = store.list_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].handle.as_ref(), Some(&second));
    }

    #[test]
    fn test_append_failure_returns_none() {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path().join("queue")).unwrap();
        fs::remove_dir_all(dir.path().join("queue")).unwrap();

        assert!(store.append(&event(1)).is_none());
    }

    #[test]
    fn test_corrupt_record_skipped() {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path()).unwrap();

        store.append(&event(1)).unwrap();
        fs::write(dir.path().join("evt-00000000000000000000000000.json"), b"{not json").unwrap();
        store.append(&event(2)).unwrap();

        let records = store.list_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(store.scan().unwrap().len(), 3);
    }

    #[test]
    fn test_scan_ignores_foreign_files() {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path()).unwrap();

        store.append(&event(1)).unwrap();
        fs::write(dir.path().join("compact-20260101T000000000Z-deadbeef.jsonl"), b"").unwrap();
        fs::write(dir.path().join(".compaction.lock"), b"").unwrap();
        fs::write(dir.path().join("evt-x.json.tmp"), b"").unwrap();
        fs::write(dir.path().join("evt-y.json.corrupt"), b"").unwrap();

        assert_eq!(store.scan().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_signals_compaction() {
        let dir = tempdir().unwrap();
        let (trigger, mut signals) = compaction_channel();
        let store = EventStore::open(dir.path()).unwrap().with_compaction_trigger(trigger);

        store.append(&event(1)).unwrap();
        store.append(&event(2)).unwrap();

        assert!(signals.try_next());
        // Coalesced: two appends leave one pending signal
        assert!(!signals.try_next());
    }

    #[test]
    fn test_list_before_checkpoint() {
        let dir = tempdir().unwrap();
        let store = EventStore::open(dir.path()).unwrap();

        store.append(&event(0)).unwrap();
        store.append(&event(1)).unwrap();
        let checkpoint = store.checkpoint();
        store.append(&event(2)).unwrap();

        let older: Vec<Event> = store
            .list_before(&checkpoint)
            .unwrap()
            .into_iter()
            .map(|r| r.event)
            .collect();
        assert_eq!(older, vec![event(0), event(1)]);
        assert_eq!(store.list_all().unwrap().len(), 3);
        assert!(!checkpoint.path().exists());
    }

    #[test]
    fn test_checkpoint_covers_other_stores_in_same_millisecond() {
        let dir = tempdir().unwrap();
        let earlier = EventStore::open(dir.path()).unwrap();
        for n in 0..20 {
            earlier.append(&event(n)).unwrap();
        }

        let later = EventStore::open(dir.path()).unwrap();
        let checkpoint = later.checkpoint();
        later.append(&event(99)).unwrap();

        assert_eq!(later.list_before(&checkpoint).unwrap().len(), 20);
    }
}
