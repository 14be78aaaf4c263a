// packages/relay/src/compaction/archive.rs
//! Archive segments
//!
//! A segment is a write-once JSON-lines file named
//! `compact-<UTC timestamp>-<random hex><ext>`, where `<ext>` is one of
//! `.jsonl`, `.jsonl.gz`, `.jsonl.zst`. The timestamp is the creation time
//! used by retention; the random suffix keeps concurrent writers apart.

use crate::recording::compressor::{CompressionCodec, Compressor};
use crate::recording::event::Event;
use crate::recording::store::TMP_SUFFIX;
use crate::utils::errors::{PipelineError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rand::Rng;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Archive file prefix
pub const ARCHIVE_PREFIX: &str = "compact-";

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

/// A compacted batch of events on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSegment {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub codec: CompressionCodec,
    pub size_bytes: u64,
}

impl ArchiveSegment {
    /// File name for a segment created at `created_at`
    pub fn file_name(created_at: DateTime<Utc>, codec: CompressionCodec) -> String {
        let suffix: u32 = rand::thread_rng().gen();
        format!(
            "{}{}-{:08x}{}",
            ARCHIVE_PREFIX,
            created_at.format(TIMESTAMP_FORMAT),
            suffix,
            codec.extension()
        )
    }

    /// Parse a segment from its path; `None` if the name is not an archive
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let rest = name.strip_prefix(ARCHIVE_PREFIX)?;
        let codec = CompressionCodec::from_file_name(name)?;
        let metadata = fs::metadata(path).ok()?;

        let created_at = rest
            .split('-')
            .next()
            .and_then(|ts| NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok())
            .map(|naive| naive.and_utc())
            .or_else(|| metadata.modified().ok().map(DateTime::<Utc>::from))?;

        Some(Self {
            path: path.to_path_buf(),
            created_at,
            codec,
            size_bytes: metadata.len(),
        })
    }

    /// All segments in `dir`, oldest first
    pub fn list(dir: &Path) -> Result<Vec<Self>> {
        let mut segments = Vec::new();

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(segment) = Self::from_path(&entry.path()) {
                segments.push(segment);
            }
        }

        segments.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(segments)
    }

    /// Delete the segment; an already-deleted segment counts as deleted
    pub fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write `jsonl` as a new segment in `dir`
///
/// The payload is written to a temporary name and fsynced before it is
/// renamed into place, so the segment is complete once it is visible.
pub fn write_segment(
    dir: &Path,
    jsonl: &[u8],
    compressor: &Compressor,
    event_count: usize,
) -> Result<ArchiveSegment> {
    let created_at = Utc::now();
    let name = ArchiveSegment::file_name(created_at, compressor.codec());
    let path = dir.join(&name);
    let tmp = dir.join(format!("{}{}", name, TMP_SUFFIX));

    let data = compressor.compress(jsonl)?;

    let write = || -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        sync_dir(dir);
        Ok(())
    };

    if let Err(e) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(PipelineError::StorageFailed(format!(
            "Failed to write archive {}: {}",
            path.display(),
            e
        )));
    }

    info!(
        archive = %path.display(),
        events = event_count,
        raw_bytes = jsonl.len(),
        stored_bytes = data.len(),
        "Archive segment written"
    );

    Ok(ArchiveSegment {
        path,
        created_at,
        codec: compressor.codec(),
        size_bytes: data.len() as u64,
    })
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), error = %e, "Directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Read the events stored in a segment, in write order
///
/// Lines that do not parse are skipped and logged.
pub fn read_archive(path: &Path) -> Result<Vec<Event>> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let codec = CompressionCodec::from_file_name(name).ok_or_else(|| {
        PipelineError::StorageFailed(format!("Not an archive segment: {}", path.display()))
    })?;

    let raw = Compressor::decompress(codec, &fs::read(path)?)?;
    let text = String::from_utf8_lossy(&raw);

    let mut events = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(
                archive = %path.display(),
                line = line_no + 1,
                error = %e,
                "Skipping malformed archive line"
            ),
        }
    }

    Ok(events)
}
