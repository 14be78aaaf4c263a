// packages/relay/src/compaction/retention.rs
//! Archive retention
//!
//! Two passes, applied in order:
//!
//! 1. **Age**: delete segments created before `now - window`, oldest first.
//! 2. **Count**: if more than `max_archives` remain, delete the oldest
//!    until the newest `max_archives` are left.
//!
//! Both passes are idempotent; a cleanup with nothing to do deletes nothing.
//! Callers serialize runs across processes with the compaction lock.
//!
//! Each cleanup also sweeps debris: `.tmp` files and parked stale locks
//! left by interrupted writers, and quarantined records older than the
//! retention window.

use crate::compaction::archive::{ArchiveSegment, ARCHIVE_PREFIX};
use crate::compaction::lock::{LOCK_FILE_NAME, STALE_MARKER};
use crate::recording::store::{CORRUPT_SUFFIX, RECORD_PREFIX, TMP_SUFFIX};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Default age after which an unfinished write is considered abandoned
pub const DEFAULT_PARTIAL_MAX_AGE: Duration = Duration::from_secs(30);

/// Outcome of one cleanup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    /// Segments removed for exceeding the retention window
    pub deleted_by_age: usize,

    /// Segments removed by the count cap
    pub deleted_by_count: usize,

    /// Segments left on disk
    pub remaining: usize,

    /// Abandoned temporaries and expired quarantined records removed
    pub debris_removed: usize,
}

impl RetentionReport {
    pub fn deleted(&self) -> usize {
        self.deleted_by_age + self.deleted_by_count
    }
}

/// Applies the retention policy to the archive directory
#[derive(Debug, Clone)]
pub struct RetentionManager {
    dir: PathBuf,
    window: Option<Duration>,
    max_archives: usize,
    partial_max_age: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Debris {
    /// Interrupted record or archive write, or a lock parked while broken
    Partial,

    /// Record that failed to parse during compaction
    Quarantined,
}

impl Debris {
    fn classify(name: &str) -> Option<Self> {
        let unfinished = name.ends_with(TMP_SUFFIX)
            && (name.starts_with(RECORD_PREFIX) || name.starts_with(ARCHIVE_PREFIX));
        let parked_lock = name.starts_with(LOCK_FILE_NAME) && name.contains(STALE_MARKER);

        if unfinished || parked_lock {
            Some(Debris::Partial)
        } else if name.starts_with(RECORD_PREFIX) && name.ends_with(CORRUPT_SUFFIX) {
            Some(Debris::Quarantined)
        } else {
            None
        }
    }

    fn label(self) -> &'static str {
        match self {
            Debris::Partial => "partial",
            Debris::Quarantined => "quarantined",
        }
    }
}

impl RetentionManager {
    /// `window: None` disables the age pass; `max_archives == 0` disables the cap
    pub fn new(dir: impl Into<PathBuf>, window: Option<Duration>, max_archives: usize) -> Self {
        Self {
            dir: dir.into(),
            window,
            max_archives,
            partial_max_age: DEFAULT_PARTIAL_MAX_AGE,
        }
    }

    /// Age after which `.tmp` files and parked locks count as abandoned
    pub fn with_partial_max_age(mut self, age: Duration) -> Self {
        self.partial_max_age = age;
        self
    }

    /// Run both passes against the current time
    pub fn cleanup(&self) -> Result<RetentionReport> {
        self.cleanup_at(Utc::now())
    }

    /// Run both passes as of `now`
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let mut segments = ArchiveSegment::list(&self.dir)?;
        let mut report = RetentionReport::default();

        if let Some(cutoff) = self.cutoff(now) {
            segments.retain(|segment| {
                if segment.created_at >= cutoff {
                    return true;
                }
                match segment.delete() {
                    Ok(()) => {
                        debug!(archive = %segment.path.display(), "Deleted archive past retention window");
                        report.deleted_by_age += 1;
                        metrics::counter!("relay_archives_deleted_total", "reason" => "age").increment(1);
                        false
                    }
                    Err(e) => {
                        warn!(archive = %segment.path.display(), error = %e, "Failed to delete expired archive");
                        true
                    }
                }
            });
        }

        if self.max_archives > 0 && segments.len() > self.max_archives {
            let excess = segments.len() - self.max_archives;
            // Oldest first, so the newest `max_archives` survive
            let mut kept = Vec::with_capacity(segments.len());
            for (i, segment) in segments.into_iter().enumerate() {
                if i >= excess {
                    kept.push(segment);
                    continue;
                }
                match segment.delete() {
                    Ok(()) => {
                        debug!(archive = %segment.path.display(), "Deleted archive over count cap");
                        report.deleted_by_count += 1;
                        metrics::counter!("relay_archives_deleted_total", "reason" => "count").increment(1);
                    }
                    Err(e) => {
                        warn!(archive = %segment.path.display(), error = %e, "Failed to delete archive over cap");
                        kept.push(segment);
                    }
                }
            }
            segments = kept;
        }

        report.remaining = segments.len();
        report.debris_removed = self.sweep_debris(now.into()).unwrap_or_else(|e| {
            warn!(dir = %self.dir.display(), error = %e, "Debris sweep failed");
            0
        });

        if report.deleted() > 0 || report.debris_removed > 0 {
            info!(
                by_age = report.deleted_by_age,
                by_count = report.deleted_by_count,
                remaining = report.remaining,
                debris = report.debris_removed,
                "Archive retention applied"
            );
        }

        Ok(report)
    }

    fn sweep_debris(&self, now: SystemTime) -> Result<usize> {
        let mut removed = 0;

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let kind = match Debris::classify(&name.to_string_lossy()) {
                Some(kind) => kind,
                None => continue,
            };

            let max_age = match (kind, self.window) {
                (Debris::Partial, _) => self.partial_max_age,
                (Debris::Quarantined, Some(window)) => window,
                (Debris::Quarantined, None) => continue,
            };

            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .map_or(false, |age| age > max_age);
            if !expired {
                continue;
            }

            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(path = %entry.path().display(), kind = kind.label(), "Removed debris");
                    metrics::counter!("relay_debris_removed_total", "kind" => kind.label()).increment(1);
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove debris"),
            }
        }

        Ok(removed)
    }

    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let window = chrono::Duration::from_std(self.window?).ok()?;
        now.checked_sub_signed(window)
    }
}
